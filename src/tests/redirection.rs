use crate::cmd;
use crate::io::{IoChain, IoClose, IoFd};
use crate::redirection::dup2_list_resolve_chain;
use crate::tests::prelude::*;
use std::sync::Arc;

#[test]
fn test_dup2s() {
    let mut chain = IoChain::new();
    chain.push(Arc::new(IoClose::new(17)));
    chain.push(Arc::new(IoFd::new(3, 19)));
    let list = dup2_list_resolve_chain(&chain);
    assert_eq!(list.get_actions().len(), 2);

    let act1 = list.get_actions()[0];
    assert_eq!(act1.src, 17);
    assert_eq!(act1.target, -1);

    let act2 = list.get_actions()[1];
    assert_eq!(act2.src, 19);
    assert_eq!(act2.target, 3);
}

#[test]
#[serial]
fn test_nested_redirections_unwind() {
    let _cleanup = test_init();
    let sh = test_shell();
    let (outer, inner_failed) = sh
        .out_s(|sh| {
            let inner = sh.out_s(|sh| {
                sh.run(cmd!("echo", "inner"))?;
                sh.run(cmd!("shpipe-no-such-program"))
            });
            // The inner scope is gone even though it failed.
            assert_eq!(sh.redirection_depth(), 1);
            sh.run(cmd!("echo", "outer"))?;
            Ok(inner.is_err())
        })
        .unwrap();
    assert!(inner_failed);
    assert_eq!(outer, "outer\n");
    assert_eq!(sh.redirection_depth(), 0);
}

#[test]
#[serial]
fn test_redirection_survives_panic() {
    let _cleanup = test_init();
    let sh = test_shell();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        sh.with_stdout_closed(|sh| {
            assert_eq!(sh.stdout_fd(), None);
            panic!("escaping the scope")
        })
    }));
    assert!(result.is_err());
    assert_eq!(sh.redirection_depth(), 0);
    assert_eq!(sh.stdout_fd(), Some(libc::STDOUT_FILENO));
}

#[test]
#[serial]
fn test_stderr_to_stdout_follows_outer_stdout() {
    let _cleanup = test_init();
    let sh = test_shell();
    let (out, _) = sh
        .out_s(|sh| {
            sh.with_redirect_stderr_to_stdout(|sh| sh.run(cmd!("sh", "-c", "echo to-stderr >&2")))
        })
        .unwrap();
    assert_eq!(out, "to-stderr\n");
}

#[test]
#[serial]
fn test_redirect_to_files() {
    let _cleanup = test_init();
    let sh = test_shell();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("out.txt");
    sh.with_redirect_stdout_to_file(&path, |sh| sh.run(cmd!("echo", "first")))
        .unwrap();
    sh.with_redirect_stdout_to_file_append(&path, |sh| sh.run(cmd!("echo", "second")))
        .unwrap();
    let (out, _) = sh
        .with_redirect_stdin_to_file(&path, |sh| sh.out_s(|sh| sh.run(cmd!("cat"))))
        .unwrap();
    assert_eq!(out, "first\nsecond\n");
}
