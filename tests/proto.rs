use std::fs;
use std::io;
use std::io::Write;

use rand::Rng;

use protofile::proto_file_in;

/// Random final name, so runs can't collide or observe each other.
fn temp_file_name() -> String {
    let mut rng = rand::thread_rng();
    (0..16).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}

#[test]
fn persist_materialises_exact_bytes() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let name = temp_file_name();

    let mut file = proto_file_in(dir.path(), &name)?;
    file.write_all(b"DELME")?;
    file.persist()?;

    assert_eq!(1, fs::read_dir(dir.path())?.count());
    assert_eq!(b"DELME".to_vec(), fs::read(dir.path().join(&name))?);
    Ok(())
}

#[test]
fn invisible_until_persisted() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let name = temp_file_name();

    let mut file = proto_file_in(dir.path(), &name)?;
    assert_eq!(dir.path().join(&name), file.final_path());
    assert!(!file.final_path().exists());

    // Only actually nameless on (modern) linux:
    #[cfg(target_os = "linux")]
    assert_eq!(0, fs::read_dir(dir.path())?.count());

    file.write_all(b"DELME")?;
    assert!(!file.final_path().exists());

    file.persist()?;
    assert!(dir.path().join(&name).exists());
    Ok(())
}

#[test]
fn discard_leaves_directory_unchanged() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let name = temp_file_name();

    let mut file = proto_file_in(dir.path(), &name)?;
    file.write_all(b"DELME")?;
    file.discard()?;

    assert_eq!(0, fs::read_dir(dir.path())?.count());
    Ok(())
}

#[test]
fn drop_leaves_directory_unchanged() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;

    let mut file = proto_file_in(dir.path(), &temp_file_name())?;
    file.write_all(b"DELME")?;
    drop(file);

    assert_eq!(0, fs::read_dir(dir.path())?.count());
    Ok(())
}

#[test]
fn discard_is_idempotent() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;

    let mut file = proto_file_in(dir.path(), &temp_file_name())?;
    file.discard()?;
    file.discard()?;

    assert_eq!(0, fs::read_dir(dir.path())?.count());
    Ok(())
}

#[test]
fn discard_after_persist_is_a_noop() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let name = temp_file_name();

    let mut file = proto_file_in(dir.path(), &name)?;
    file.write_all(b"DELME")?;
    file.persist()?;
    file.discard()?;

    assert_eq!(b"DELME".to_vec(), fs::read(dir.path().join(&name))?);
    assert_eq!(1, fs::read_dir(dir.path())?.count());
    Ok(())
}

#[test]
fn persist_is_single_call() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;

    let mut file = proto_file_in(dir.path(), &temp_file_name())?;
    file.persist()?;
    assert!(file.persist().is_err());
    assert!(file.write_all(b"late").is_err());
    Ok(())
}

#[test]
fn creates_missing_directories() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let nested = dir.path().join("deep").join("er");
    let name = temp_file_name();

    let mut file = proto_file_in(&nested, &name)?;
    file.write_all(b"DELME")?;
    file.persist()?;

    assert_eq!(b"DELME".to_vec(), fs::read(nested.join(&name))?);
    Ok(())
}

#[test]
fn persist_replaces_existing_file() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let name = temp_file_name();
    fs::write(dir.path().join(&name), b"stale")?;

    let mut file = proto_file_in(dir.path(), &name)?;
    file.write_all(b"fresh")?;
    file.persist()?;

    assert_eq!(b"fresh".to_vec(), fs::read(dir.path().join(&name))?);
    assert_eq!(1, fs::read_dir(dir.path())?.count());
    Ok(())
}

#[test]
fn noclobber_refuses_existing_file() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let name = temp_file_name();
    fs::write(dir.path().join(&name), b"keep me")?;

    let mut file = proto_file_in(dir.path(), &name)?;
    file.write_all(b"interloper")?;
    assert!(file.persist_noclobber().is_err());
    file.discard()?;

    assert_eq!(b"keep me".to_vec(), fs::read(dir.path().join(&name))?);
    assert_eq!(1, fs::read_dir(dir.path())?.count());
    Ok(())
}

#[test]
fn directory_occupant_is_never_removed() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let name = temp_file_name();
    fs::create_dir(dir.path().join(&name))?;

    let mut file = proto_file_in(dir.path(), &name)?;
    file.write_all(b"DELME")?;
    assert!(file.persist().is_err());

    // The handle survives a failed persist; discard still cleans up.
    file.discard()?;
    assert!(dir.path().join(&name).is_dir());
    assert_eq!(1, fs::read_dir(dir.path())?.count());
    Ok(())
}

#[test]
fn reserve_size_is_only_a_hint() -> io::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let name = temp_file_name();

    let mut file = proto_file_in(dir.path(), &name)?;
    file.reserve_size(16)?;
    file.reserve_size(1 << 20)?;

    file.write_all(b"DELME")?;
    file.persist()?;

    // A reservation extends the file with zeros, so only the prefix is
    // ours; where fallocate is unsupported the hint vanished entirely.
    let content = fs::read(dir.path().join(&name))?;
    assert_eq!(b"DELME", &content[..5]);
    assert!(content.len() == 5 || content.len() == 1 << 20);
    Ok(())
}
