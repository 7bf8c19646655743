//! End-to-end file system scenarios over an in-memory device.

use std::sync::Arc;
use std::thread;

use pintail::error::Error;
use pintail::fs::FileSys;
use pintail::hal::MemDisk;
use pintail::param::{MAX_FILE_SIZE, NDIRECT, NINDIRECT, SECTOR_SIZE};

fn mount(sectors: u32) -> (Arc<MemDisk>, Arc<FileSys>) {
    let disk = Arc::new(MemDisk::new(sectors));
    let fs = FileSys::new(disk.clone(), true).unwrap();
    (disk, fs)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn allocated_map(fs: &FileSys, sectors: u32) -> Vec<bool> {
    (0..sectors).map(|s| fs.sector_allocated(s)).collect()
}

#[test]
fn deep_path_create_and_read_back() {
    let (_, fs) = mount(4096);
    fs.mkdir("/a", None).unwrap();
    fs.mkdir("/a/b", None).unwrap();
    fs.mkdir("/a/b/c", None).unwrap();
    fs.create("/a/b/c/file", 200, false, None).unwrap();

    let data = pattern(200);
    {
        let file = fs.open("/a/b/c/file", None).unwrap();
        assert_eq!(file.write_at(&data, 0).unwrap(), 200);
    }

    let file = fs.open("/a/b/c/file", None).unwrap();
    let mut back = vec![0u8; 200];
    assert_eq!(file.read_at(&mut back, 0), 200);
    assert_eq!(back, data);

    let dir = fs.open("/a/b/c", None).unwrap();
    assert!(dir.is_dir());
    assert!(!file.is_dir());
    assert_ne!(file.inumber(), dir.inumber());
}

#[test]
fn sparse_extension_zero_fills_the_gap() {
    let (_, fs) = mount(4096);
    fs.create("/sparse", 0, false, None).unwrap();
    let file = fs.open("/sparse", None).unwrap();

    let off = (NDIRECT * SECTOR_SIZE + NINDIRECT * SECTOR_SIZE + 100) as u32;
    assert_eq!(file.write_at(b"HELLO", off).unwrap(), 5);
    assert_eq!(file.length(), off + 5);

    let mut buf = [0xffu8; 16];
    assert_eq!(file.read_at(&mut buf, 0), 16);
    assert_eq!(buf, [0u8; 16]);
    assert_eq!(file.read_at(&mut buf, (NDIRECT * SECTOR_SIZE) as u32), 16);
    assert_eq!(buf, [0u8; 16]);

    let mut hello = [0u8; 5];
    assert_eq!(file.read_at(&mut hello, off), 5);
    assert_eq!(&hello, b"HELLO");
}

#[test]
fn remove_while_open_defers_reclamation() {
    let (_, fs) = mount(4096);
    let before = allocated_map(&fs, 4096);

    fs.create("/x", 1024, false, None).unwrap();
    let data = pattern(1024);
    let file = fs.open("/x", None).unwrap();
    file.write_at(&data, 0).unwrap();
    let ino = file.inumber();

    fs.remove("/x", None).unwrap();
    // The name is gone immediately, the handle keeps working.
    assert_eq!(fs.open("/x", None).unwrap_err(), Error::NotFound);
    let mut back = vec![0u8; 1024];
    assert_eq!(file.read_at(&mut back, 0), 1024);
    assert_eq!(back, data);
    assert!(fs.sector_allocated(ino));

    // Last close returns every owned sector to the free map.
    drop(file);
    assert!(!fs.sector_allocated(ino));
    assert_eq!(allocated_map(&fs, 4096), before);
}

#[test]
fn directory_removal_rules() {
    let (_, fs) = mount(4096);
    fs.mkdir("/d", None).unwrap();
    fs.create("/d/f", 0, false, None).unwrap();

    assert_eq!(fs.remove("/d", None).unwrap_err(), Error::NotEmpty);
    fs.remove("/d/f", None).unwrap();
    fs.remove("/d", None).unwrap();

    fs.mkdir("/e", None).unwrap();
    let handle = fs.open("/e", None).unwrap();
    assert_eq!(fs.remove("/e", None).unwrap_err(), Error::Busy);
    drop(handle);
    fs.remove("/e", None).unwrap();

    assert_eq!(fs.remove("/", None).unwrap_err(), Error::Busy);
}

#[test]
fn create_name_rules() {
    let (_, fs) = mount(4096);
    fs.create("/u", 0, false, None).unwrap();
    assert_eq!(fs.create("/u", 0, false, None).unwrap_err(), Error::Exists);

    assert_eq!(
        fs.create("/abcdefghijklmno", 0, false, None).unwrap_err(),
        Error::Invalid
    );
    fs.create("/abcdefghijklmn", 0, false, None).unwrap();

    assert_eq!(fs.create("/v/", 0, false, None).unwrap_err(), Error::Invalid);
    assert_eq!(fs.create("", 0, false, None).unwrap_err(), Error::Invalid);
    assert_eq!(fs.create("/a/.", 0, true, None).unwrap_err(), Error::Invalid);
    assert_eq!(fs.create("/a/..", 0, true, None).unwrap_err(), Error::Invalid);

    assert_eq!(
        fs.create("/nodir/f", 0, false, None).unwrap_err(),
        Error::NotFound
    );
}

#[test]
fn relative_paths_and_dot_components() {
    let (_, fs) = mount(4096);
    fs.mkdir("/a", None).unwrap();
    fs.mkdir("/a/b", None).unwrap();

    let cwd = fs.chdir("/a/b", None).unwrap();
    fs.create("f", 100, false, Some(&cwd)).unwrap();
    assert!(fs.open("/a/b/f", None).is_ok());

    // `.` and `..` resolve against the stored parent chain.
    assert!(fs.open("./f", Some(&cwd)).is_ok());
    assert!(fs.open("../b/f", Some(&cwd)).is_ok());
    let parent = fs.open("..", Some(&cwd)).unwrap();
    let a = fs.open("/a", None).unwrap();
    assert_eq!(parent.inumber(), a.inumber());

    // Consecutive slashes collapse.
    assert!(fs.open("//a///b//f", None).is_ok());

    // Root's parent is root itself.
    let root = fs.open("/", None).unwrap();
    let above = fs.chdir("../../..", None).unwrap();
    assert_eq!(above.inode().inumber(), root.inumber());

    // chdir with an empty path stays put.
    let same = fs.chdir("", Some(&cwd)).unwrap();
    assert_eq!(same.inode().inumber(), cwd.inode().inumber());
}

#[test]
fn readdir_lists_live_entries() {
    let (_, fs) = mount(4096);
    fs.mkdir("/r", None).unwrap();
    fs.create("/r/f1", 0, false, None).unwrap();
    fs.create("/r/f2", 0, false, None).unwrap();
    fs.create("/r/f3", 0, false, None).unwrap();
    fs.remove("/r/f2", None).unwrap();

    let mut dir = fs.open("/r", None).unwrap();
    let mut names = Vec::new();
    while let Some(name) = dir.readdir().unwrap() {
        names.push(String::from_utf8(name.to_vec()).unwrap());
    }
    names.sort();
    assert_eq!(names, ["f1", "f3"]);

    let mut plain = fs.open("/r/f1", None).unwrap();
    assert_eq!(plain.readdir().unwrap_err(), Error::NotDir);
}

#[test]
fn deny_write_is_shared_across_openers() {
    let (_, fs) = mount(4096);
    fs.create("/prog", 512, false, None).unwrap();

    let mut f1 = fs.open("/prog", None).unwrap();
    let f2 = fs.open("/prog", None).unwrap();

    f1.deny_write();
    assert_eq!(f2.write_at(b"nope", 0).unwrap_err(), Error::Denied);

    f1.allow_write();
    assert_eq!(f2.write_at(b"yes!", 0).unwrap(), 4);

    // Closing a denying file re-allows writes on its own.
    let mut f3 = fs.open("/prog", None).unwrap();
    f3.deny_write();
    assert_eq!(f2.write_at(b"no", 0).unwrap_err(), Error::Denied);
    drop(f3);
    assert_eq!(f2.write_at(b"ok", 0).unwrap(), 2);
}

#[test]
fn growth_zero_fills_and_length_never_shrinks() {
    let (_, fs) = mount(4096);
    fs.create("/g", 100, false, None).unwrap();
    let file = fs.open("/g", None).unwrap();
    assert_eq!(file.length(), 100);

    file.write_at(&[7u8; 10], 400).unwrap();
    assert_eq!(file.length(), 410);

    let mut mid = [0xffu8; 100];
    assert_eq!(file.read_at(&mut mid, 200), 100);
    assert_eq!(mid, [0u8; 100]);

    // Writing inside the file leaves the length alone.
    file.write_at(&[1u8; 8], 0).unwrap();
    assert_eq!(file.length(), 410);
}

#[test]
fn oversized_writes_are_rejected_up_front() {
    let (_, fs) = mount(4096);
    fs.create("/big", 0, false, None).unwrap();
    let file = fs.open("/big", None).unwrap();
    assert_eq!(
        file.write_at(b"x", MAX_FILE_SIZE).unwrap_err(),
        Error::FileTooLarge
    );
    assert_eq!(file.length(), 0);
}

#[test]
fn allocation_failure_fails_the_write_not_the_volume() {
    let (_, fs) = mount(64);
    fs.create("/big", 0, false, None).unwrap();
    let file = fs.open("/big", None).unwrap();

    let huge = vec![9u8; 100 * 1024];
    assert_eq!(file.write_at(&huge, 0).unwrap_err(), Error::NoSpace);
    assert_eq!(file.length(), 0);
    drop(file);

    // The volume keeps working afterwards.
    fs.remove("/big", None).unwrap();
    fs.create("/small", 512, false, None).unwrap();
    let small = fs.open("/small", None).unwrap();
    assert_eq!(small.write_at(&[3u8; 512], 0).unwrap(), 512);
}

#[test]
fn file_cursor_read_write_seek_tell() {
    let (_, fs) = mount(4096);
    fs.create("/c", 0, false, None).unwrap();
    let mut file = fs.open("/c", None).unwrap();

    assert_eq!(file.write(b"hello world").unwrap(), 11);
    assert_eq!(file.tell(), 11);

    file.seek(6);
    let mut word = [0u8; 5];
    assert_eq!(file.read(&mut word), 5);
    assert_eq!(&word, b"world");
    assert_eq!(file.tell(), 11);

    // Reads at end of file are short, not errors.
    assert_eq!(file.read(&mut word), 0);

    // An independent reopen starts at position zero.
    let mut again = file.reopen();
    assert_eq!(again.tell(), 0);
    assert_eq!(again.read(&mut word), 5);
    assert_eq!(&word, b"hello");
}

#[test]
fn contents_survive_close_and_remount() {
    let disk = Arc::new(MemDisk::new(4096));
    let data = pattern(3000);
    {
        let fs = FileSys::new(disk.clone(), true).unwrap();
        fs.mkdir("/keep", None).unwrap();
        fs.create("/keep/data", 0, false, None).unwrap();
        let file = fs.open("/keep/data", None).unwrap();
        assert_eq!(file.write_at(&data, 0).unwrap(), data.len());
        drop(file);
        fs.close().unwrap();
    }

    let fs = FileSys::new(disk, false).unwrap();
    let file = fs.open("/keep/data", None).unwrap();
    let mut back = vec![0u8; data.len()];
    assert_eq!(file.read_at(&mut back, 0), data.len());
    assert_eq!(back, data);
}

#[test]
fn write_behind_daemon_commits_dirty_sectors() {
    let (disk, fs) = mount(4096);
    fs.create("/wb", 0, false, None).unwrap();
    let file = fs.open("/wb", None).unwrap();
    file.write_at(&pattern(1024), 0).unwrap();

    let before = disk.write_count();
    fs.flush_tick();
    assert!(disk.write_count() > before);
    // Everything reached the device; another tick writes nothing.
    let settled = disk.write_count();
    fs.flush_tick();
    assert_eq!(disk.write_count(), settled);
}

#[test]
fn concurrent_writers_on_distinct_files() {
    let (_, fs) = mount(8192);
    let mut handles = Vec::new();
    for t in 0..4 {
        let fs = fs.clone();
        handles.push(thread::spawn(move || {
            let path = format!("/t{}", t);
            fs.create(&path, 0, false, None).unwrap();
            let file = fs.open(&path, None).unwrap();
            let data = vec![t as u8 + 1; 4096];
            assert_eq!(file.write_at(&data, 0).unwrap(), data.len());
            let mut back = vec![0u8; data.len()];
            assert_eq!(file.read_at(&mut back, 0), data.len());
            assert_eq!(back, data);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // All four files exist with the right contents.
    for t in 0..4u8 {
        let file = fs.open(&format!("/t{}", t), None).unwrap();
        let mut byte = [0u8; 1];
        assert_eq!(file.read_at(&mut byte, 4095), 1);
        assert_eq!(byte[0], t + 1);
    }
}

#[test]
fn concurrent_readers_during_extension() {
    let (_, fs) = mount(8192);
    fs.create("/shared", 0, false, None).unwrap();
    let writer = fs.open("/shared", None).unwrap();
    writer.write_at(&pattern(512), 0).unwrap();

    let mut handles = Vec::new();
    for _ in 0..3 {
        let fs = fs.clone();
        handles.push(thread::spawn(move || {
            let file = fs.open("/shared", None).unwrap();
            for _ in 0..50 {
                let mut buf = [0u8; 64];
                let n = file.read_at(&mut buf, 0);
                assert_eq!(n, 64);
                assert_eq!(buf[..], pattern(64)[..]);
            }
        }));
    }
    for i in 0..20u32 {
        writer.write_at(&pattern(512), 512 * (i + 1)).unwrap();
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(writer.length(), 512 * 21);
}
