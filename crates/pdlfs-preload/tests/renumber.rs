//! Native descriptors that land on a live PDLFS id are renumbered.
//!
//! Kept in its own binary with a single test: the kernel hands out the
//! lowest free number, and no other thread may open files meanwhile.

use pdlfs_preload::{OpenFlags, Preload, PreloadConfig};
use tempfile::TempDir;

#[test]
fn native_descriptor_renumbered_past_pdlfs_id() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("pdlfs").to_string_lossy().into_owned();
    let outside = dir.path().join("other");
    std::fs::create_dir(&outside).unwrap();
    let outside = outside.to_string_lossy().into_owned();
    let p = Preload::new(&PreloadConfig::new(root.clone())).unwrap();

    let a = p.open(&format!("{outside}/a"), OpenFlags::create(), 0o644).unwrap();
    let b = p.open(&format!("{outside}/b"), OpenFlags::create(), 0o644).unwrap();
    assert!(a > 2);
    assert_eq!(b, a + 1);
    p.close(a).unwrap();

    // The PDLFS file reuses a's kernel number but gets the next synthetic id.
    let pdlfs = p.open(&format!("{root}/f"), OpenFlags::create(), 0o644).unwrap();
    assert_eq!(pdlfs, b + 1);

    // The kernel now hands out b + 1, which is taken.
    let c = p.open(&format!("{outside}/c"), OpenFlags::create(), 0o644).unwrap();
    assert_eq!(c, pdlfs + 1);

    for (fd, data) in [(b, &b"bee"[..]), (pdlfs, b"pdlfs"), (c, b"sea")] {
        assert_eq!(p.pwrite(fd, data, 0).unwrap(), data.len());
    }
    for (fd, data) in [(b, &b"bee"[..]), (pdlfs, b"pdlfs"), (c, b"sea")] {
        let mut buf = vec![0u8; data.len()];
        assert_eq!(p.pread(fd, &mut buf, 0).unwrap(), data.len());
        assert_eq!(buf, data);
        assert_eq!(p.fstat(fd).unwrap().size, data.len() as u64);
    }

    p.shutdown().unwrap();
    assert_eq!(p.open_fds(), 0);
    assert_eq!(std::fs::read(format!("{outside}/c")).unwrap(), b"sea");
    assert_eq!(std::fs::read(format!("{root}/f")).unwrap(), b"pdlfs");
}
