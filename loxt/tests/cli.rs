//! End-to-end tests that drive the compiled `loxt` binary the way a user
//! would: a script path on the command line, assertions on stdout, stderr,
//! and exit code (spec.md §6.3, §8).

use assert_cmd::Command;
use predicates::str::contains;
use std::io::Write as _;
use tempfile::NamedTempFile;

fn script(source: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp script");
    file.write_all(source.as_bytes()).expect("write script");
    file
}

#[test]
fn runs_a_fibonacci_script_and_prints_the_result() {
    let file = script(
        r#"
        fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); }
        print fib(15);
        "#,
    );

    Command::cargo_bin("loxt")
        .unwrap()
        .arg(file.path())
        .assert()
        .success()
        .stdout(contains("610"));
}

#[test]
fn closures_keep_independent_state() {
    let file = script(
        r#"
        fun makeCounter() {
            var count = 0;
            fun inc() { count = count + 1; return count; }
            return inc;
        }
        var a = makeCounter();
        var b = makeCounter();
        print a();
        print a();
        print b();
        "#,
    );

    Command::cargo_bin("loxt")
        .unwrap()
        .arg(file.path())
        .assert()
        .success()
        .stdout("1\n2\n1\n");
}

#[test]
fn classes_and_inheritance_dispatch_through_super() {
    let file = script(
        r#"
        class Animal {
            speak() { print "..."; }
        }
        class Dog < Animal {
            speak() { super.speak(); print "Woof"; }
        }
        Dog().speak();
        "#,
    );

    Command::cargo_bin("loxt")
        .unwrap()
        .arg(file.path())
        .assert()
        .success()
        .stdout("...\nWoof\n");
}

#[test]
fn a_compile_error_exits_65_and_writes_nothing_to_stdout() {
    let file = script("print ;");

    Command::cargo_bin("loxt")
        .unwrap()
        .arg(file.path())
        .assert()
        .code(65)
        .stdout("")
        .stderr(contains("Error"));
}

#[test]
fn a_runtime_error_exits_70_with_a_backtrace() {
    let file = script("print 1 + nil;");

    Command::cargo_bin("loxt")
        .unwrap()
        .arg(file.path())
        .assert()
        .code(70)
        .stderr(contains("Runtime Error"))
        .stderr(contains("in script"));
}

#[test]
fn a_missing_script_path_exits_as_a_usage_error() {
    Command::cargo_bin("loxt")
        .unwrap()
        .arg("/no/such/script.lox")
        .assert()
        .code(64)
        .stderr(contains("could not read script"));
}
