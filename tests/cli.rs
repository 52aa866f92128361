//! End-to-end checks through the installed binary.

use std::io::Write as _;

use assert_cmd::Command;
use predicates::prelude::*;

fn dirk() -> Command {
    Command::cargo_bin("dirk").expect("binary builds")
}

fn source_file(content: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::Builder::new()
        .suffix(".c")
        .tempfile()
        .expect("temp file");
    f.write_all(content.as_bytes()).expect("write");
    f
}

#[test]
fn test_hello_world() {
    dirk()
        .arg("testdata/hello.c")
        .assert()
        .success()
        .stdout("hello, world\n");
}

#[test]
fn test_exit_code_is_the_guest_return_value() {
    let f = source_file("enum { C = 20 }; int main(){ printf(\"y\\n\"); return C; }");
    dirk()
        .arg(f.path())
        .assert()
        .code(20)
        .stdout("y\n");
}

#[test]
fn test_listing_mode_prints_code_and_does_not_execute() {
    let f = source_file("int main(){ printf(\"%d\\n\", 6*7); return 0; }\n");
    dirk()
        .arg("-s")
        .arg(f.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("ENT"))
        .stdout(predicate::str::contains("PRTF"))
        .stdout(predicate::str::contains("42").not());
}

#[test]
fn test_debug_mode_traces_instructions() {
    let f = source_file("int main(){ return 0; }");
    dirk()
        .arg("-d")
        .arg(f.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("1> ENT"))
        .stdout(predicate::str::contains("EXIT"));
}

#[test]
fn test_guest_receives_arguments() {
    let f = source_file(
        "int main(int argc, char **argv){ printf(\"%d %s\\n\", argc, *(argv+1)); return 0; }",
    );
    dirk()
        .arg(f.path())
        .arg("beta")
        .assert()
        .success()
        .stdout(predicate::str::ends_with("beta\n"));
}

#[test]
fn test_compile_error_exits_nonzero_with_diagnostic() {
    // The one-line "<line>: <message>" form lands on stdout; the annotated
    // report is a stderr extra.
    let f = source_file("int main(){ @ }");
    dirk()
        .arg(f.path())
        .assert()
        .code(255)
        .stdout(predicate::str::contains("1: bad character"))
        .stderr(predicate::str::contains("bad character"));
}

#[test]
fn test_missing_file_is_reported() {
    dirk()
        .arg("definitely/not/here.c")
        .assert()
        .code(255)
        .stdout(predicate::str::contains("could not open"));
}

#[test]
fn test_pool_size_override() {
    dirk()
        .args(["--pool-size", "65536", "testdata/hello.c"])
        .assert()
        .success()
        .stdout("hello, world\n");
}
