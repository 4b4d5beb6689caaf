use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;

const SHEBANG_PROBE_BYTES: usize = 256;

/// The program and argv actually spawned for a stdio server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl ResolvedCommand {
    fn literal(command: &str, args: &[String]) -> Self {
        Self {
            program: command.into(),
            args: args.iter().map(OsString::from).collect(),
        }
    }
}

/// Finds what to spawn for `command`.
///
/// Bare names are searched on `path_var` (or the process `PATH`). A script whose first line is
/// a `#!` runs through its interpreter, and Windows `.cmd`/`.bat` wrappers run through
/// `cmd.exe`. Anything that cannot be resolved is returned as given, so the spawn itself
/// reports the failure.
pub async fn resolve_executable(
    command: &str,
    args: &[String],
    path_var: Option<&str>,
) -> ResolvedCommand {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let search_path = path_var
        .map(OsString::from)
        .or_else(|| std::env::var_os("PATH"));
    let resolved = match which::which_in(command, search_path, &cwd) {
        Ok(path) => path,
        Err(err) => {
            tracing::debug!(command, "executable not resolved ({err}); using it as given");
            return ResolvedCommand::literal(command, args);
        }
    };

    if is_windows_batch(&resolved) {
        let mut wrapped: Vec<OsString> = ["/d", "/s", "/c"].into_iter().map(OsString::from).collect();
        wrapped.push(resolved.into_os_string());
        wrapped.extend(args.iter().map(OsString::from));
        return ResolvedCommand {
            program: "cmd.exe".into(),
            args: wrapped,
        };
    }

    if let Some((interpreter, interpreter_arg)) = read_shebang(&resolved).await {
        let mut wrapped = Vec::with_capacity(args.len() + 2);
        if let Some(arg) = interpreter_arg {
            wrapped.push(OsString::from(arg));
        }
        wrapped.push(resolved.into_os_string());
        wrapped.extend(args.iter().map(OsString::from));
        return ResolvedCommand {
            program: interpreter.into(),
            args: wrapped,
        };
    }

    ResolvedCommand {
        program: resolved.into_os_string(),
        args: args.iter().map(OsString::from).collect(),
    }
}

fn is_windows_batch(path: &Path) -> bool {
    cfg!(windows)
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("cmd") || ext.eq_ignore_ascii_case("bat"))
}

/// Interpreter and its optional single argument, e.g. `/usr/bin/env` + `node`.
async fn read_shebang(path: &Path) -> Option<(String, Option<String>)> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let mut head = vec![0u8; SHEBANG_PROBE_BYTES];
    let mut filled = 0;
    while filled < head.len() {
        let n = file.read(&mut head[filled..]).await.ok()?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);

    let rest = head.strip_prefix(b"#!")?;
    let line_end = rest.iter().position(|b| *b == b'\n').unwrap_or(rest.len());
    let line = std::str::from_utf8(&rest[..line_end]).ok()?.trim();
    let (interpreter, arg) = match line.split_once(char::is_whitespace) {
        Some((interpreter, arg)) => (interpreter, Some(arg.trim().to_string())),
        None => (line, None),
    };
    if interpreter.is_empty() {
        return None;
    }
    Some((
        interpreter.to_string(),
        arg.filter(|arg| !arg.is_empty()),
    ))
}
