#![allow(clippy::uninlined_format_args)]

use rsconf::Target;
use std::error::Error;

fn main() {
    rsconf::rebuild_if_paths_changed(&["src", "Cargo.toml", "build.rs"]);

    let build = cc::Build::new();
    let mut target = Target::new_from(build).unwrap();
    target.set_verbose(true);
    detect_cfgs(&mut target);
}

type Detector = dyn Fn(&Target) -> Result<bool, Box<dyn Error>>;

/// Check target system support for certain functionality when the build is invoked.
///
/// We use [`rsconf::declare_cfg()`] rather than cargo features: these describe what the
/// platform supports, not something a user would opt in to.
#[rustfmt::skip]
fn detect_cfgs(target: &mut Target) {
    let checks: [(&str, &Detector); 4] = [
        ("apple", &detect_apple),
        ("use_posix_spawn", &|target: &Target| {
            Ok(target.has_header("spawn.h"))
        }),
        ("have_pipe2", &|target: &Target| {
            Ok(target.has_symbol("pipe2"))
        }),
        ("waitstatus_signal_ret", &|target: &Target| {
            Ok(target.r#if("WEXITSTATUS(0x007f) == 0x7f", &["sys/wait.h"]))
        }),
    ];
    for (name, handler) in checks {
        match handler(target) {
            Err(e) => {
                rsconf::warn!("{}: {}", name, e);
                rsconf::declare_cfg(name, false);
            },
            Ok(enabled) => rsconf::declare_cfg(name, enabled),
        }
    }
}

fn detect_apple(_: &Target) -> Result<bool, Box<dyn Error>> {
    Ok(cfg!(any(target_os = "ios", target_os = "macos")))
}
