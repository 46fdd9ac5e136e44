use std::{
    fs,
    io::{self, Read, Seek, Write},
    path::PathBuf,
};

use crate::{err_at, read_file, write_file, Error, Result};

use super::*;

#[test]
fn test_open_file_rw() {
    // case 1: try to create empty file.
    let dir = PathBuf::new();
    let fd = create_file_a(dir.as_os_str());
    match fd.expect_err("expected invalid-file") {
        Error::InvalidFile(_, _) => (),
        err => panic!("{:?}", err),
    }

    // case 2: try to create root dir as file.
    let mut dir = PathBuf::new();
    dir.push("/");
    let fd = create_file_a(dir.as_os_str());
    match fd.expect_err("expected invalid-file") {
        Error::InvalidFile(_, _) => (),
        err => panic!("{:?}", err),
    }

    // case 3: create valid file afresh.
    let mut dir = std::env::temp_dir();
    dir.push("rust.ncache.util.open_file_rw.txt");
    let file = dir.as_path();

    fs::remove_file(file).ok();

    let mut fd = create_file_a(file.as_os_str()).expect("open-write");
    assert_eq!(fd.write("hello world".as_bytes()).expect("write failed"), 11);
    fd.seek(io::SeekFrom::Start(1)).expect("seek failed");
    // append mode, seek is ignored on write.
    assert_eq!(fd.write("i world".as_bytes()).expect("write failed"), 7);

    let txt = fs::read(file).expect("read failed");
    assert_eq!(std::str::from_utf8(&txt).unwrap(), "hello worldi world");

    // case 4: append to existing file.
    let mut fd = open_file_a(file.as_os_str()).expect("open-write");
    assert_eq!(fd.write("hello world".as_bytes()).expect("write failed"), 11);
    assert_eq!(fd.write("i world".as_bytes()).expect("write failed"), 7);

    let txt = fs::read(&file).expect("read failed");
    assert_eq!(
        std::str::from_utf8(&txt).unwrap(),
        "hello worldi worldhello worldi world"
    );

    // case 5: read file.
    let mut fd = open_file_r(file.as_ref()).expect("open-read");
    let mut txt = [0_u8; 36];
    assert_eq!(fd.read(&mut txt).expect("read failed"), txt.len());
    assert_eq!(
        std::str::from_utf8(&txt).unwrap(),
        "hello worldi worldhello worldi world"
    );

    fd.write("hello world".as_bytes())
        .expect_err("expected write error");
}

#[test]
fn test_read_write_file_macros() -> Result<()> {
    let mut dir = std::env::temp_dir();
    dir.push("rust.ncache.util.read_write_file.txt");
    let file = dir.as_path();

    let mut fd = create_file_a(file.as_os_str())?;
    let n: usize = write_file!(fd, "0123456789".as_bytes(), file, "test-write-file")?;
    assert_eq!(n, 10);

    let mut fd = open_file_r(file.as_ref())?;
    let buf = read_file!(fd, io::SeekFrom::Start(2), 5, "test-read-file")?;
    assert_eq!(std::str::from_utf8(&buf).unwrap(), "23456");

    let res: Result<Vec<u8>> = read_file!(fd, io::SeekFrom::Start(8), 5, "short");
    assert!(res.is_err());

    Ok(())
}

#[test]
fn test_load_toml() {
    let mut dir = std::env::temp_dir();
    dir.push("rust.ncache.util.load_toml.toml");
    let file = dir.as_path();

    fs::write(file, "[storage]\nname = \"nctest\"\ntimeout = 600\n").unwrap();

    let value: toml::Value = load_toml(&file).expect("load_toml");
    let section = &value["storage"];
    assert_eq!(section["name"].as_str(), Some("nctest"));
    assert_eq!(section["timeout"].as_integer(), Some(600));
}
