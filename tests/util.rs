//! Shared test utilities for integration tests
//!
//! Provides project fixtures and a handle on the `pwr` binary.

#![allow(dead_code)]

use assert_cmd::Command;
use assert_fs::prelude::*;

/// A small project with one CRLF file to exercise line-ending handling.
pub fn make_project() -> assert_fs::TempDir
{
    let tmp = assert_fs::TempDir::new().expect("tempdir");

    tmp.child("src/lib.rs")
        .write_str("pub fn greet() -> &'static str {\n    \"hello\"\n}\n")
        .expect("write lib");
    tmp.child("README.md")
        .write_str("# Demo\n\nSome text.\n")
        .expect("write readme");
    tmp.child("notes/windows.txt")
        .write_str("one\r\ntwo\r\nthree\r\n")
        .expect("write crlf");

    tmp
}

/// Write model output next to the project and return its path.
pub fn model_output(
    tmp: &assert_fs::TempDir,
    name: &str,
    text: &str,
) -> std::path::PathBuf
{
    let child = tmp.child(format!("out/{name}"));
    child
        .write_str(text)
        .expect("write model output");
    child
        .path()
        .to_path_buf()
}

/// `pwr --root <tmp> --no-color ...`
pub fn pwr(tmp: &assert_fs::TempDir) -> Command
{
    let mut cmd = Command::cargo_bin("pwr").expect("pwr binary");
    cmd.arg("--root")
        .arg(tmp.path())
        .arg("--no-color")
        .env_remove("PATCHWRIGHT_LOG");
    cmd
}

/// Edit renaming the greeting in `src/lib.rs`.
pub const EDIT_GREETING: &str = r#"Here is the change:

```edit
path: src/lib.rs
<<<<<<< SEARCH
    "hello"
=======
    "hello, world"
>>>>>>> REPLACE
```
"#;
