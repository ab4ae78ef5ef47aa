use crate::error::Error;
use crate::tests::prelude::*;
use crate::{cmd, Callable, PopenStreams};
use std::io::{Read, Write};

#[test]
#[serial]
fn test_capture_callable_output_and_value() {
    let _cleanup = test_init();
    let sh = test_shell();
    let (out, value) = sh
        .out_s(|sh| {
            Ok(sh.call(|streams| {
                streams.stdout.write_all(b"abc").unwrap();
                42
            }))
        })
        .unwrap();
    assert_eq!(out, "abc");
    assert_eq!(value, 42);
}

#[test]
#[serial]
fn test_out_variants() {
    let _cleanup = test_init();
    let sh = test_shell();
    let (out, ok) = sh.out_ss(|sh| sh.run(cmd!("printf", "x y \\n\\n"))).unwrap();
    assert!(ok);
    assert_eq!(out, "x y");

    let (lines, _) = sh.out_lines(|sh| sh.run(cmd!("printf", "a\\n\\nb\\n"))).unwrap();
    assert_eq!(lines, vec!["a", "", "b"]);

    let (both, _) = sh
        .out_err_s(|sh| sh.run(cmd!("sh", "-c", "echo out; echo err >&2")))
        .unwrap();
    assert_eq!(both, "out\nerr\n");

    let (both, ok) = sh
        .out_err_ss(|sh| sh.run(cmd!("sh", "-c", "echo out; echo err >&2; echo")))
        .unwrap();
    assert!(ok);
    assert_eq!(both, "out\nerr");
}

#[test]
#[serial]
fn test_nested_captures() {
    let _cleanup = test_init();
    let sh = test_shell();
    let (outer, inner) = sh
        .out_s(|sh| {
            sh.run(cmd!("echo", "outer"))?;
            let (inner, _) = sh.out_s(|sh| sh.run(cmd!("echo", "inner")))?;
            sh.run(cmd!("echo", "again"))?;
            Ok(inner)
        })
        .unwrap();
    assert_eq!(outer, "outer\nagain\n");
    assert_eq!(inner, "inner\n");
}

#[test]
#[serial]
fn test_feeding_input() {
    let _cleanup = test_init();
    let sh = test_shell();
    let (out, ok) = sh.io_s("hello\n", |sh| sh.run(cmd!("tr", "a-z", "A-Z"))).unwrap();
    assert!(ok);
    assert_eq!(out, "HELLO\n");

    let (out, ok) = sh.io_ss("a\nb\n", |sh| sh.run(cmd!("sort", "-r"))).unwrap();
    assert!(ok);
    assert_eq!(out, "b\na");

    let (out, _) = sh
        .out_s(|sh| sh.in_lines(["b", "a"], |sh| sh.run(cmd!("sort"))))
        .unwrap();
    assert_eq!(out, "a\nb\n");

    let read = sh
        .in_s("from a callable", |sh| Ok(sh.call(|streams| streams.stdin.read_all().unwrap())))
        .unwrap();
    assert_eq!(read, "from a callable");
}

#[test]
#[serial]
fn test_each_line() {
    let _cleanup = test_init();
    with_each_launcher(|launcher| {
        let sh = test_shell();
        let mut seen = vec![];
        let ok = sh
            .each_line(cmd!("printf", "1\\n2\\n3"), |line| seen.push(line.to_owned()))
            .unwrap();
        assert!(ok, "{}", launcher);
        assert_eq!(seen, vec!["1", "2", "3"], "{}", launcher);
    });

    let sh = test_shell();
    let mut seen = vec![];
    let producer = Callable::new("producer", |streams| writeln!(streams.stdout, "x\ny"));
    assert!(sh.each_line(producer, |line| seen.push(line.to_owned())).unwrap());
    assert_eq!(seen, vec!["x", "y"]);
}

#[test]
#[serial]
fn test_popen_round_trip() {
    let _cleanup = test_init();
    let sh = test_shell();
    let mut child = sh
        .popen(cmd!("tr", "a-z", "A-Z"), PopenStreams::STDIN | PopenStreams::STDOUT)
        .unwrap();
    assert!(child.stderr().is_none());
    {
        let mut stdin = child.take_stdin().unwrap();
        stdin.write_all(b"piped\n").unwrap();
    }
    let mut out = String::new();
    child.stdout().unwrap().read_to_string(&mut out).unwrap();
    assert_eq!(out, "PIPED\n");
    assert!(child.wait().unwrap());
}

#[test]
#[serial]
fn test_popen_stderr_and_policy() {
    let _cleanup = test_init();
    let sh = test_shell();
    let mut child = sh
        .popen(cmd!("sh", "-c", "echo oops >&2; exit 5"), PopenStreams::STDERR)
        .unwrap();
    let mut err = String::new();
    child.stderr().unwrap().read_to_string(&mut err).unwrap();
    assert_eq!(err, "oops\n");
    let err = sh
        .raise_on_command_error(|_| child.wait())
        .unwrap_err();
    assert_eq!(err.as_command_error().unwrap().status_value(), 5);
}

#[test]
#[serial]
fn test_dropped_popen_is_reaped() {
    let _cleanup = test_init();
    let sh = test_shell();
    let child = sh.popen(cmd!("cat"), PopenStreams::STDIN).unwrap();
    let pid = child.pid().unwrap().as_pid_t();
    drop(child);
    // cat sees EOF once our end of its stdin is closed, and is then reaped.
    assert_reaped(pid);
}

#[test]
#[serial]
fn test_popen_stderr_into_stdout() {
    let _cleanup = test_init();
    with_each_launcher(|launcher| {
        let sh = test_shell();
        let mut child = sh
            .popen(
                cmd!("sh", "-c", "echo out; echo err >&2"),
                PopenStreams::STDOUT | PopenStreams::STDERR_TO_STDOUT,
            )
            .unwrap();
        assert!(child.stderr().is_none(), "{}", launcher);
        let mut out = String::new();
        child.stdout().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "out\nerr\n", "{}", launcher);
        assert!(child.wait().unwrap(), "{}", launcher);
    });
}

#[test]
#[serial]
fn test_popen_stderr_into_stdout_needs_stdout() {
    let _cleanup = test_init();
    let sh = test_shell();
    let baseline = open_fd_count();
    for streams in [
        PopenStreams::STDERR_TO_STDOUT,
        PopenStreams::STDIN | PopenStreams::STDERR_TO_STDOUT,
        PopenStreams::STDOUT | PopenStreams::STDERR | PopenStreams::STDERR_TO_STDOUT,
    ] {
        let err = sh.popen(cmd!("true"), streams).err().unwrap();
        assert!(matches!(err, Error::InvalidArgument(_)), "{:?}: {}", streams, err);
    }
    assert_fds_return_to(baseline);
}
