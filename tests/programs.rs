//! End-to-end scenarios through the library API: compile a source string,
//! execute it in-process, and check stdout plus the exit code.

use std::io::Write as _;

use dirk::{compile, CompileOptions};

fn run(source: &str) -> (String, i64) {
    run_with_args(source, &[])
}

fn run_with_args(source: &str, args: &[&str]) -> (String, i64) {
    let program = compile(source, &CompileOptions::default()).expect("compile failed");
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let mut out = Vec::new();
    let result = dirk::run_program(&program, &args, false, &mut out).expect("vm run failed");
    (String::from_utf8(out).expect("guest output is utf-8"), result.exit_code)
}

#[test]
fn test_hello_world() {
    let (out, code) = run("int main(){ printf(\"hello, world\\n\"); return 0; }");
    assert_eq!(out, "hello, world\n");
    assert_eq!(code, 0);
}

#[test]
fn test_arithmetic_precedence() {
    let (out, code) = run("int main(){ printf(\"%d\\n\", 1+2*3); return 0; }");
    assert_eq!(out, "7\n");
    assert_eq!(code, 0);
}

#[test]
fn test_while_and_locals() {
    let (out, code) = run(
        "int main(){ int i; int s; i=1; s=0; while(i<=10){ s=s+i; i=i+1; } printf(\"%d\\n\",s); return 0; }",
    );
    assert_eq!(out, "55\n");
    assert_eq!(code, 0);
}

#[test]
fn test_pointer_and_char_array() {
    let (out, code) =
        run("int main(){ char *p; p = \"abc\"; printf(\"%c%c\\n\", *p, *(p+2)); return 0; }");
    assert_eq!(out, "ac\n");
    assert_eq!(code, 0);
}

#[test]
fn test_enum_and_if_else() {
    let (out, code) = run(
        "enum { A=10, B, C=20 }; int main(){ if (B==11) printf(\"y\\n\"); else printf(\"n\\n\"); return C; }",
    );
    assert_eq!(out, "y\n");
    assert_eq!(code, 20);
}

#[test]
fn test_recursion() {
    let (out, code) = run(
        "int fib(int n){ if (n < 2) return n; return fib(n-1) + fib(n-2); } \
         int main(){ printf(\"%d\\n\", fib(10)); return 0; }",
    );
    assert_eq!(out, "55\n");
    assert_eq!(code, 0);
}

#[test]
fn test_mutual_recursion_via_forward_call() {
    // odd() is used before its definition; the call site is backpatched.
    let (out, code) = run(
        "int even(int n){ if (n == 0) return 1; return odd(n - 1); } \
         int odd(int n){ if (n == 0) return 0; return even(n - 1); } \
         int main(){ printf(\"%d%d\\n\", even(10), odd(7)); return 0; }",
    );
    assert_eq!(out, "11\n");
    assert_eq!(code, 0);
}

#[test]
fn test_string_concatenation() {
    let (out, _) = run("int main(){ char *p; p = \"ab\" \"cd\"; printf(\"%s\\n\", p); return 0; }");
    assert_eq!(out, "abcd\n");
}

#[test]
fn test_number_bases() {
    let (out, _) = run("int main(){ printf(\"%d %d %d\\n\", 0x10, 010, 10); return 0; }");
    assert_eq!(out, "16 8 10\n");
}

#[test]
fn test_bitwise_operators() {
    let (out, _) = run(
        "int main(){ printf(\"%d %d %d %d\\n\", 12 & 10, 12 | 10, 12 ^ 10, ~0); return 0; }",
    );
    assert_eq!(out, "8 14 6 -1\n");
}

#[test]
fn test_shifts_are_arithmetic() {
    let (out, _) = run("int main(){ printf(\"%d %d\\n\", 1 << 4, -16 >> 2); return 0; }");
    assert_eq!(out, "16 -4\n");
}

#[test]
fn test_division_truncates_toward_zero() {
    let (out, _) = run("int main(){ printf(\"%d %d\\n\", -7 / 2, -7 % 2); return 0; }");
    assert_eq!(out, "-3 -1\n");
}

#[test]
fn test_short_circuit_evaluation() {
    let (out, _) = run(
        "int main(){ int a; int b; a = 0; b = 0; a || (b = 1); a && (b = 2); \
         printf(\"%d%d\\n\", a, b); return 0; }",
    );
    assert_eq!(out, "01\n");
}

#[test]
fn test_ternary() {
    let (out, _) = run(
        "int main(){ int x; x = 3; printf(\"%s\\n\", x > 2 ? \"big\" : \"small\"); return 0; }",
    );
    assert_eq!(out, "big\n");
}

#[test]
fn test_pre_and_post_increment() {
    // Arguments are pushed left to right, so evaluation order is fixed.
    let (out, _) = run("int main(){ int i; i = 5; printf(\"%d %d %d\\n\", i++, i, ++i); return 0; }");
    assert_eq!(out, "5 6 7\n");
}

#[test]
fn test_pointer_walk_counts_string_length() {
    let (out, _) = run(
        "int main(){ char *p; int n; p = \"stride\"; n = 0; while (*p) { p++; n++; } \
         printf(\"%d\\n\", n); return 0; }",
    );
    assert_eq!(out, "6\n");
}

#[test]
fn test_globals() {
    let (out, _) = run("int g; int main(){ g = 3; g = g + 4; printf(\"%d\\n\", g); return 0; }");
    assert_eq!(out, "7\n");
}

#[test]
fn test_sizeof() {
    let (out, _) = run(
        "int main(){ printf(\"%d %d %d %d\\n\", sizeof(char), sizeof(int), sizeof(char*), sizeof(int*)); return 0; }",
    );
    assert_eq!(out, "1 8 8 8\n");
}

#[test]
fn test_malloc_and_byte_stores() {
    let (out, _) = run(
        "int main(){ char *b; b = malloc(4); *b = 65; *(b+1) = 66; *(b+2) = 0; \
         printf(\"%s\\n\", b); return 0; }",
    );
    assert_eq!(out, "AB\n");
}

#[test]
fn test_memset_and_memcmp() {
    let (out, code) = run(
        "int main(){ char *b; b = malloc(8); memset(b, 65, 3); *(b+3) = 0; \
         printf(\"%s\\n\", b); return memcmp(b, \"AAA\", 3); }",
    );
    assert_eq!(out, "AAA\n");
    assert_eq!(code, 0);
}

#[test]
fn test_exit_syscall_stops_the_program() {
    let (out, code) = run("int main(){ printf(\"before\\n\"); exit(7); printf(\"after\\n\"); return 0; }");
    assert_eq!(out, "before\n");
    assert_eq!(code, 7);
}

#[test]
fn test_argc_argv() {
    let (out, code) = run_with_args(
        "int main(int argc, char **argv){ printf(\"%d %s\\n\", argc, *(argv+1)); return 0; }",
        &["prog.c", "alpha"],
    );
    assert_eq!(out, "2 alpha\n");
    assert_eq!(code, 0);
}

#[test]
fn test_open_read_close() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(b"hi").expect("write");
    let path = file.path().to_str().expect("utf-8 path");
    let (out, _) = run_with_args(
        "int main(int argc, char **argv){ int fd; char *buf; int n; \
         buf = malloc(16); fd = open(*(argv+1), 0); n = read(fd, buf, 15); \
         buf[n] = 0; close(fd); printf(\"%d:%s\\n\", n, buf); return 0; }",
        &["prog.c", path],
    );
    assert_eq!(out, "2:hi\n");
}

#[test]
fn test_character_escapes() {
    let (out, _) = run("int main(){ printf(\"%d %d %d %d\\n\", '\\n', '\\t', '\\r', '\\0'); return 0; }");
    assert_eq!(out, "10 9 13 0\n");
}

#[test]
fn test_casts_select_load_width() {
    let (out, _) = run(
        "int main(){ int x; char *p; x = 0x4142; p = (char*)&x; \
         printf(\"%c%c\\n\", *p, *(p+1)); return 0; }",
    );
    // Little-endian: low byte first.
    assert_eq!(out, "BA\n");
}

#[test]
fn test_nested_calls_and_arguments() {
    let (out, _) = run(
        "int max(int a, int b){ if (a > b) return a; return b; } \
         int main(){ printf(\"%d\\n\", max(max(1, 5), 3)); return 0; }",
    );
    assert_eq!(out, "5\n");
}

#[test]
fn test_empty_statements_and_blocks() {
    let (out, code) = run("int main(){ ; { ; } if (1) ; else ; printf(\"ok\\n\"); return 0; }");
    assert_eq!(out, "ok\n");
    assert_eq!(code, 0);
}
