use crate::error::Error;
use crate::exec::SpawnOptions;
use crate::io::{IoFile, IoPipe};
use crate::tests::prelude::*;
use crate::proc::{defer_reap, reap_pending_pids};
use crate::{cmd, Callable, ProcStatus, SpawnHandle};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
#[serial]
fn test_true_and_false() {
    let _cleanup = test_init();
    with_each_launcher(|launcher| {
        let sh = test_shell();
        assert!(sh.run(cmd!("true")).unwrap(), "{}", launcher);
        assert!(!sh.run(cmd!("false")).unwrap(), "{}", launcher);
    });
}

#[test]
#[serial]
fn test_exit_status_is_reported() {
    let _cleanup = test_init();
    with_each_launcher(|launcher| {
        let sh = test_shell();
        let handle = sh
            .spawn(cmd!("sh", "-c", "exit 7"), SpawnOptions::new())
            .unwrap();
        assert!(handle.pid().is_some());
        let status = handle.wait().unwrap();
        assert_eq!(status.exit_code(), 7, "{}", launcher);
    });
}

#[test]
#[serial]
fn test_command_not_found() {
    let _cleanup = test_init();
    let sh = test_shell();
    let err = sh
        .run(cmd!("shpipe-this-command-does-not-exist", "arg"))
        .unwrap_err();
    match err {
        Error::Spawn { command, source } => {
            assert_eq!(command, "shpipe-this-command-does-not-exist arg");
            assert_eq!(source.0, libc::ENOENT);
        }
        err => panic!("unexpected error {:?}", err),
    }
}

#[test]
#[serial]
fn test_unrunnable_binary_fails_to_spawn() {
    let _cleanup = test_init();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("garbage");
    {
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"\x7fELF\0\x02\x01\x01GARBAGE\0").unwrap();
        file.set_permissions(std::fs::Permissions::from_mode(0o755))
            .unwrap();
    }
    with_each_launcher(|launcher| {
        let sh = test_shell();
        let err = sh.run(cmd!(&path)).unwrap_err();
        assert!(
            matches!(err, Error::Spawn { ref source, .. } if source.0 == libc::ENOEXEC),
            "{}: {:?}",
            launcher,
            err
        );
    });
}

#[test]
#[serial]
fn test_shebangless_script_runs_under_sh() {
    let _cleanup = test_init();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("script");
    {
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"echo from script \"$1\"\n").unwrap();
        file.set_permissions(std::fs::Permissions::from_mode(0o755))
            .unwrap();
    }
    with_each_launcher(|launcher| {
        let sh = test_shell();
        let (out, ok) = sh.out_s(|sh| sh.run(cmd!(&path, "x"))).unwrap();
        assert!(ok, "{}", launcher);
        assert_eq!(out, "from script x\n", "{}", launcher);
    });
}

#[test]
#[serial]
fn test_stdout_override_with_pipe() {
    let _cleanup = test_init();
    with_each_launcher(|launcher| {
        let sh = test_shell();
        let pipe = crate::fds::make_autoclose_pipes().unwrap();
        let options =
            SpawnOptions::new().stdout(Arc::new(IoPipe::new(libc::STDOUT_FILENO, pipe.write)));
        let handle = sh.spawn(cmd!("echo", "hello"), options).unwrap();
        let mut out = String::new();
        std::fs::File::from(pipe.read)
            .read_to_string(&mut out)
            .unwrap();
        assert!(handle.wait().unwrap().is_success());
        assert_eq!(out, "hello\n", "{}", launcher);
    });
}

#[test]
#[serial]
fn test_close_list_closes_fd_in_child() {
    let _cleanup = test_init();
    let sh = test_shell();
    let scratch = crate::tempfile::new_unlinked().unwrap();
    // Put an inheritable fd at 5, then ask for it to be closed.
    let cmd = cmd!("sh", "-c", "echo visible >&5")
        .redirect(Arc::new(IoFile::dup_of(5, &scratch).unwrap()))
        .close(5);
    assert!(!sh.run(cmd).unwrap());

    let cmd = cmd!("sh", "-c", "echo visible >&5")
        .redirect(Arc::new(IoFile::dup_of(5, &scratch).unwrap()));
    assert!(sh.run(cmd).unwrap());
}

#[test]
#[serial]
fn test_close_others_hides_inherited_fds() {
    let _cleanup = test_init();
    let sh = test_shell();
    // An fd without CLOEXEC, as a library outside our control might leave behind.
    let scratch = crate::tempfile::new_unlinked().unwrap();
    let leaked = unsafe { libc::dup(scratch.as_raw_fd()) };
    assert!(leaked >= 0);
    let check = format!("test -e /dev/fd/{}", leaked);

    assert!(sh.run(cmd!("sh", "-c", &check)).unwrap());
    assert!(!sh.run(cmd!("sh", "-c", &check).close_others(true)).unwrap());
    unsafe { libc::close(leaked) };
}

#[test]
#[serial]
fn test_callable_spawn_runs_on_thread() {
    let _cleanup = test_init();
    let sh = test_shell();
    let main_thread = std::thread::current().id();
    let handle = sh
        .spawn(
            Callable::new("elsewhere", move |_| std::thread::current().id() != main_thread),
            SpawnOptions::new(),
        )
        .unwrap();
    assert!(handle.pid().is_none());
    assert_eq!(handle.command_line(), "elsewhere");
    assert!(handle.wait().unwrap().is_success());
}

#[test]
#[serial]
fn test_callable_panic_becomes_failure() {
    let _cleanup = test_init();
    let sh = test_shell();
    let (err_out, status) = sh
        .out_err_s(|sh| {
            let handle = sh.spawn(
                Callable::new("exploder", |_| -> () { panic!("kaboom") }),
                SpawnOptions::new(),
            )?;
            Ok(handle.wait().unwrap())
        })
        .unwrap();
    assert_eq!(status, ProcStatus::from_exit_code(1));
    assert_eq!(err_out, "shpipe: callable 'exploder' panicked: kaboom\n");
}

#[test]
#[serial]
fn test_call_isolated() {
    let _cleanup = test_init();
    let sh = test_shell();
    let value = sh
        .call_isolated("answer", |streams| {
            // Changes made inside do not leak out.
            streams
                .shell()
                .with_error_policy(crate::ErrorPolicy::Raise, |_| 42)
        })
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(sh.error_policy(), crate::ErrorPolicy::Ignore);

    let err = sh
        .call_isolated("broken", |_| -> u8 { panic!("no value") })
        .unwrap_err();
    match err {
        Error::Execution { callable, message } => {
            assert_eq!(callable, "broken");
            assert_eq!(message, "no value");
        }
        err => panic!("unexpected error {:?}", err),
    }
}

#[test]
#[serial]
fn test_spawn_detached_is_reaped() {
    let _cleanup = test_init();
    with_each_launcher(|_| {
        let sh = test_shell();
        let handle = sh.spawn(cmd!("true"), SpawnOptions::new()).unwrap();
        let pid = handle.pid().unwrap().as_pid_t();
        handle.detach();
        assert_reaped(pid);
    });
}

#[test]
#[serial]
fn test_pending_pid_is_reaped_by_later_spawn() {
    let _cleanup = test_init();
    let sh = test_shell();
    let pipe = crate::fds::make_autoclose_pipes().unwrap();
    let options = SpawnOptions::new().stdin(Arc::new(IoPipe::new(libc::STDIN_FILENO, pipe.read)));
    let SpawnHandle::External(proc) = sh.spawn(cmd!("cat"), options).unwrap() else {
        panic!("cat should be an external process");
    };
    let pid = proc.pid;
    // As if no reaper thread could be started.
    defer_reap(pid);
    reap_pending_pids();
    assert_eq!(unsafe { libc::kill(pid.as_pid_t(), 0) }, 0, "running pid was dropped");

    drop(pipe.write);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        // Every spawn polls the pending pids.
        assert!(sh.run(cmd!("true")).unwrap());
        let gone = unsafe { libc::kill(pid.as_pid_t(), 0) } < 0 && errno::errno().0 == libc::ESRCH;
        if gone {
            break;
        }
        assert!(Instant::now() < deadline, "pending pid {} was never reaped", pid);
        std::thread::sleep(Duration::from_millis(10));
    }
}
