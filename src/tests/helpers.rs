use crate::exec::SpawnOptions;
use crate::tests::prelude::*;
use crate::{cmd, Callable, Stage};
use std::ffi::OsStr;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::sync::mpsc;

#[test]
#[serial]
fn test_with_env_sets_and_restores() {
    let _cleanup = test_init();
    let sh = test_shell();
    std::env::set_var("SHPIPE_TEST_KEEP", "before");
    std::env::remove_var("SHPIPE_TEST_NEW");
    let (out, _) = sh
        .with_env(
            [
                ("SHPIPE_TEST_KEEP", None),
                ("SHPIPE_TEST_NEW", Some("fresh")),
            ],
            |sh| {
                assert_eq!(sh.var("SHPIPE_TEST_NEW").as_deref(), Some(OsStr::new("fresh")));
                assert_eq!(sh.var("SHPIPE_TEST_KEEP"), None);
                // The process itself is untouched.
                assert_eq!(std::env::var_os("SHPIPE_TEST_NEW"), None);
                sh.out_s(|sh| {
                    sh.run(cmd!(
                        "sh",
                        "-c",
                        "echo \"${SHPIPE_TEST_KEEP-unset} $SHPIPE_TEST_NEW\""
                    ))
                })
            },
        )
        .unwrap();
    assert_eq!(out, "unset fresh\n");
    assert_eq!(sh.var("SHPIPE_TEST_KEEP").as_deref(), Some(OsStr::new("before")));
    assert_eq!(sh.var("SHPIPE_TEST_NEW"), None);
    std::env::remove_var("SHPIPE_TEST_KEEP");
}

#[test]
#[serial]
fn test_with_env_rejects_bad_names() {
    let _cleanup = test_init();
    let sh = test_shell();
    let result: crate::Result<()> = sh.with_env([("SHPIPE_TEST_ERR", Some("1")), ("BAD=NAME", Some("x"))], |_| {
        panic!("must not run with invalid changes")
    });
    assert!(result.is_err());
    assert_eq!(sh.var("SHPIPE_TEST_ERR"), None);
}

#[test]
#[serial]
fn test_with_cwd() {
    let _cleanup = test_init();
    let sh = test_shell();
    let dir = TempDir::new().unwrap();
    let real_dir = dir.path().canonicalize().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    let before = std::env::current_dir().unwrap();
    let (out, inner) = sh
        .with_cwd(dir.path(), |sh| {
            assert_eq!(sh.current_dir().unwrap(), real_dir);
            // Relative paths follow the context.
            let inner = sh.with_cwd("sub", |sh| sh.current_dir())?;
            sh.with_redirect_stdout_to_file("written", |sh| sh.run(cmd!("echo", "here")))?;
            let out = sh.out_ss(|sh| sh.run(cmd!("sh", "-c", "pwd -P; echo $PWD")))?;
            Ok((out.0, inner))
        })
        .unwrap();
    assert_eq!(out, format!("{0}\n{0}", real_dir.display()));
    assert_eq!(inner, real_dir.join("sub"));
    assert_eq!(std::fs::read_to_string(real_dir.join("written")).unwrap(), "here\n");
    assert_eq!(std::env::current_dir().unwrap(), before);
    assert_eq!(sh.current_dir().unwrap(), before);

    assert!(sh.with_cwd(dir.path().join("missing"), |_| Ok(())).is_err());
    assert!(sh.with_cwd(real_dir.join("written"), |_| Ok(())).is_err());
}

#[test]
#[serial]
fn test_relative_program_follows_cwd() {
    let _cleanup = test_init();
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("hello");
    std::fs::write(&script, "#!/bin/sh\necho hello from $0\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    with_each_launcher(|launcher| {
        let sh = test_shell();
        let (out, ok) = sh
            .with_cwd(dir.path(), |sh| sh.out_ss(|sh| sh.run(cmd!("./hello"))))
            .unwrap();
        assert!(ok, "{}", launcher);
        assert!(out.starts_with("hello from"), "{}: {}", launcher, out);
    });
}

#[test]
#[serial]
fn test_callable_env_and_cwd_are_private() {
    let _cleanup = test_init();
    let sh = test_shell();
    let dir = TempDir::new().unwrap();
    let real_dir = dir.path().canonicalize().unwrap();
    let cwd_before = std::env::current_dir().unwrap();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let target = real_dir.clone();
    let task = Callable::new("private-scope", move |streams| -> crate::Result<()> {
        streams
            .shell()
            .with_env([("SHPIPE_TEST_PRIVATE", Some("inside"))], |sh| {
                sh.with_cwd(&target, |sh| {
                    let (seen, _) = sh.out_ss(|sh| {
                        sh.run(cmd!("sh", "-c", "echo \"$SHPIPE_TEST_PRIVATE $(pwd -P)\""))
                    })?;
                    let _ = entered_tx.send(seen);
                    // Hold the scopes open while the caller looks.
                    let _ = release_rx.recv();
                    Ok(())
                })
            })
    });
    let handle = sh.spawn(task, SpawnOptions::new()).unwrap();

    let seen = entered_rx.recv().unwrap();
    assert_eq!(seen, format!("inside {}", real_dir.display()));
    assert_eq!(sh.var("SHPIPE_TEST_PRIVATE"), None);
    assert_eq!(std::env::var_os("SHPIPE_TEST_PRIVATE"), None);
    assert_eq!(std::env::current_dir().unwrap(), cwd_before);
    assert_eq!(sh.current_dir().unwrap(), cwd_before);
    let (outside, _) = sh
        .out_ss(|sh| {
            sh.run(cmd!("sh", "-c", "echo \"${SHPIPE_TEST_PRIVATE-unset} $(pwd -P)\""))
        })
        .unwrap();
    assert_eq!(
        outside,
        format!("unset {}", cwd_before.canonicalize().unwrap().display())
    );

    release_tx.send(()).unwrap();
    assert!(handle.wait().unwrap().is_success());
}

#[test]
#[serial]
fn test_callable_inherits_env_and_cwd() {
    let _cleanup = test_init();
    let sh = test_shell();
    let dir = TempDir::new().unwrap();
    let real_dir = dir.path().canonicalize().unwrap();
    let (seen, _) = sh
        .with_env([("SHPIPE_TEST_INHERITED", Some("yes"))], |sh| {
            sh.with_cwd(dir.path(), |sh| {
                sh.out_s(|sh| {
                    sh.pipe([
                        cmd!("true").into(),
                        Callable::new("report", |streams| {
                            let sh = streams.shell();
                            let var = sh.var("SHPIPE_TEST_INHERITED").unwrap_or_default();
                            let cwd = sh.current_dir().unwrap_or_default();
                            writeln!(streams.stdout, "{} {}", var.to_string_lossy(), cwd.display())
                        })
                        .into(),
                    ])
                })
            })
        })
        .unwrap();
    assert_eq!(seen, format!("yes {}\n", real_dir.display()));
}

fn stages(names: &[&'static str]) -> Vec<Stage> {
    names.iter().map(|name| cmd!(name).into()).collect()
}

#[test]
#[serial]
fn test_sequences() {
    let _cleanup = test_init();
    let sh = test_shell();
    assert!(sh.run_seq(stages(&["false", "true"])).unwrap());
    assert!(!sh.run_seq(stages(&["true", "false"])).unwrap());
    assert!(sh.run_seq(vec![]).unwrap());

    assert!(sh.run_and(stages(&["true", "true"])).unwrap());
    assert!(!sh.run_and(stages(&["true", "false", "shpipe-never-reached"])).unwrap());

    assert!(sh.run_or(stages(&["false", "true", "shpipe-never-reached"])).unwrap());
    assert!(!sh.run_or(stages(&["false", "false"])).unwrap());
    assert!(!sh.run_or(vec![]).unwrap());
}

#[test]
#[serial]
fn test_run_or_raises_only_for_last() {
    let _cleanup = test_init();
    let sh = test_shell();
    let result = sh.raise_on_command_error(|sh| sh.run_or(stages(&["false", "true"])));
    assert!(result.unwrap());
    let err = sh
        .raise_on_command_error(|sh| sh.run_or(stages(&["false", "false"])))
        .unwrap_err();
    assert_eq!(err.as_command_error().unwrap().command_line, "false");
}

#[test]
#[serial]
fn test_run_seq_mixes_stage_kinds() {
    let _cleanup = test_init();
    let sh = test_shell();
    let (out, ok) = sh
        .out_s(|sh| {
            sh.run_seq(vec![
                cmd!("echo", "from a program").into(),
                Callable::new("greeter", |streams| {
                    writeln!(streams.stdout, "from a callable")
                })
                .into(),
            ])
        })
        .unwrap();
    assert!(ok);
    assert_eq!(out, "from a program\nfrom a callable\n");
}

#[test]
#[serial]
fn test_filters() {
    let _cleanup = test_init();
    let sh = test_shell();
    let (out, _) = sh
        .io_s("keep 1\ndrop\nkeep 2\n", |sh| {
            Ok(sh.call(|streams| {
                streams
                    .filter_lines(|line| line.starts_with("keep").then(|| line.replace("keep", "kept")))
                    .unwrap()
            }))
        })
        .unwrap();
    assert_eq!(out, "kept 1\nkept 2\n");

    let (out, count) = sh
        .io_s("a-b-c", |sh| {
            Ok(sh.call(|streams| {
                streams
                    .filter_chars(|c| if c == '-' { None } else { Some(c) })
                    .unwrap()
            }))
        })
        .unwrap();
    assert_eq!(out, "abc");
    assert_eq!(count, 3);
}
