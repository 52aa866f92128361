//! Self-hosting checks: the compiler's dialect rendition (`testdata/dirk.c`)
//! must compile and run guest programs (stage 1), and must compile itself
//! into a compiler that still behaves identically (stage 2).

use std::io::Write as _;

use dirk::{compile, CompileOptions};

const BOOT: &str = include_str!("../testdata/dirk.c");

/// The bootstrap compiler allocates its own 256 KiB pools out of the host
/// heap, twice over for stage 2, so the host arenas get room to spare.
fn options() -> CompileOptions {
    CompileOptions {
        listing: false,
        pool_size: 4 * 1024 * 1024,
    }
}

fn run_boot(args: &[&str]) -> (String, i64) {
    let program = compile(BOOT, &options()).expect("bootstrap compile failed");
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let mut out = Vec::new();
    let result = dirk::run_program(&program, &args, false, &mut out).expect("vm run failed");
    (String::from_utf8(out).expect("guest output is utf-8"), result.exit_code)
}

fn scenario_file(dir: &tempfile::TempDir, name: &str, source: &str) -> String {
    let path = dir.path().join(name);
    let mut f = std::fs::File::create(&path).expect("create scenario file");
    f.write_all(source.as_bytes()).expect("write scenario file");
    path.to_str().expect("utf-8 path").to_string()
}

/// The spec's end-to-end scenarios: (file name, source, stdout, exit code).
fn scenarios() -> Vec<(&'static str, &'static str, &'static str, i64)> {
    vec![
        (
            "hello.c",
            "int main(){ printf(\"hello, world\\n\"); return 0; }",
            "hello, world\n",
            0,
        ),
        (
            "prec.c",
            "int main(){ printf(\"%d\\n\", 1+2*3); return 0; }",
            "7\n",
            0,
        ),
        (
            "sum.c",
            "int main(){ int i; int s; i=1; s=0; while(i<=10){ s=s+i; i=i+1; } printf(\"%d\\n\",s); return 0; }",
            "55\n",
            0,
        ),
        (
            "ptr.c",
            "int main(){ char *p; p = \"abc\"; printf(\"%c%c\\n\", *p, *(p+2)); return 0; }",
            "ac\n",
            0,
        ),
        (
            "enum.c",
            "enum { A=10, B, C=20 }; int main(){ if (B==11) printf(\"y\\n\"); else printf(\"n\\n\"); return C; }",
            "y\n",
            20,
        ),
    ]
}

#[test]
fn test_stage1_runs_the_scenarios() {
    let dir = tempfile::tempdir().expect("temp dir");
    for (name, source, stdout, code) in scenarios() {
        let path = scenario_file(&dir, name, source);
        let (out, status) = run_boot(&["dirk.c", path.as_str()]);
        assert_eq!(out, stdout, "stage-1 stdout for {name}");
        assert_eq!(status, code, "stage-1 exit code for {name}");
    }
}

#[test]
fn test_stage2_matches_stage1() {
    let dir = tempfile::tempdir().expect("temp dir");
    for (name, source, stdout, code) in scenarios() {
        let path = scenario_file(&dir, name, source);

        let (stage1_out, stage1_code) = run_boot(&["dirk.c", path.as_str()]);
        // Stage 2: the bootstrap compiler compiles its own source, and that
        // freshly built compiler compiles and runs the scenario.
        let (stage2_out, stage2_code) = run_boot(&["dirk.c", "testdata/dirk.c", path.as_str()]);

        assert_eq!(stage1_out, stdout, "stage-1 stdout for {name}");
        assert_eq!(stage1_code, code, "stage-1 exit code for {name}");
        assert_eq!(stage2_out, stage1_out, "stage drift in stdout for {name}");
        assert_eq!(stage2_code, stage1_code, "stage drift in exit code for {name}");
    }
}

#[test]
fn test_bootstrap_reports_compile_errors() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = scenario_file(&dir, "bad.c", "int main(){ @ }");
    let (out, code) = run_boot(&["dirk.c", path.as_str()]);
    assert!(out.contains("bad character"), "got: {out}");
    assert_eq!(code, -1);
}
