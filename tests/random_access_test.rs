use rand::{thread_rng, Rng};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::tempdir;
use worldpack::extract::ArchiveReader;
use worldpack::{pack, unpack, PackOptions, UnpackOptions};

fn write_random_file(p: &Path, sz: usize) {
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut f = File::create(p).unwrap();
    let mut buf = vec![0u8; sz];
    thread_rng().fill(&mut buf[..]);
    f.write_all(&buf).unwrap();
}

fn packed(src: &Path) -> (tempfile::TempDir, PathBuf) {
    write_random_file(&src.join("a.txt"), 1500);
    write_random_file(&src.join("dir/b.bin"), 3000);
    fs::write(src.join("dir/c.log"), "log line\n".repeat(300)).unwrap();
    let arch_dir = tempdir().unwrap();
    let arch_path = arch_dir.path().join("test.wpack");
    pack(src, &arch_path, &PackOptions::default()).unwrap();
    (arch_dir, arch_path)
}

#[test]
fn random_access_read_single_entry() {
    let src = tempdir().unwrap();
    let (_keep, arch_path) = packed(src.path());

    let mut reader = ArchiveReader::open(&arch_path).unwrap();
    let entry = reader.find("dir/c.log").unwrap().clone();
    let bytes = reader.read_entry(&entry).unwrap();
    assert_eq!(bytes, fs::read(src.path().join("dir/c.log")).unwrap());
    assert!(reader.find("dir/missing").is_none());
    assert!(reader.find("dir").unwrap().is_dir());
}

#[test]
fn selective_extract_writes_only_the_selection() {
    let src = tempdir().unwrap();
    let (_keep, arch_path) = packed(src.path());

    // We want to extract only dir/c.log
    let want_rel = PathBuf::from("dir/c.log");
    let out = tempdir().unwrap();
    let summary = unpack(&arch_path, out.path(), &["dir/c.log".to_string()], &UnpackOptions::default()).unwrap();
    assert_eq!(summary.processed, 1);

    let extracted_path = out.path().join(&want_rel);
    assert_eq!(fs::read(src.path().join(&want_rel)).unwrap(), fs::read(&extracted_path).unwrap());

    // Ensure other files were NOT extracted
    assert!(!out.path().join("a.txt").exists());
    assert!(!out.path().join("dir/b.bin").exists());
}

#[test]
fn selecting_a_directory_brings_its_contents() {
    let src = tempdir().unwrap();
    let (_keep, arch_path) = packed(src.path());

    let out = tempdir().unwrap();
    let summary = unpack(&arch_path, out.path(), &["dir".to_string()], &UnpackOptions::default()).unwrap();
    assert_eq!(summary.processed, 3);
    assert!(out.path().join("dir/b.bin").exists());
    assert!(out.path().join("dir/c.log").exists());
    assert!(!out.path().join("a.txt").exists());
}

#[test]
fn unpacking_over_an_existing_tree_replaces_files() {
    let src = tempdir().unwrap();
    let (_keep, arch_path) = packed(src.path());

    let out = tempdir().unwrap();
    fs::create_dir_all(out.path().join("dir")).unwrap();
    fs::write(out.path().join("dir/c.log"), "stale").unwrap();
    unpack(&arch_path, out.path(), &[], &UnpackOptions::default()).unwrap();
    assert_eq!(
        fs::read(out.path().join("dir/c.log")).unwrap(),
        fs::read(src.path().join("dir/c.log")).unwrap()
    );
}
