//! Symbol search path for the platform symbol service.

/// Builds the `;`-separated search path handed to the symbol service.
///
/// The path lists, in order: the directory of the executable taken from
/// `command_line`, the working directory `cwd`, `%SYSTEMROOT%`,
/// `%SYSTEMROOT%\system32`, `%_NT_SYMBOL_PATH%` and `%_NT_ALT_SYMBOL_PATH%`.
/// Quotes are stripped, since the service rejects them, and repeated entries
/// are kept once, compared case-insensitively.
pub fn build_search_path(
    command_line: &str,
    cwd: &str,
    env: impl Fn(&str) -> Option<String>,
) -> String {
    let mut entries: Vec<String> = vec![executable_dir(command_line), cwd.to_string()];

    if let Some(root) = env("SYSTEMROOT") {
        let system32 = format!("{root}\\system32");
        entries.push(root);
        entries.push(system32);
    }
    entries.extend(env("_NT_SYMBOL_PATH"));
    entries.extend(env("_NT_ALT_SYMBOL_PATH"));

    let mut path = String::new();
    let mut seen: Vec<String> = Vec::new();
    for entry in entries.iter().flat_map(|entry| entry.split(';')) {
        let entry = entry.replace('"', "");
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let key = entry.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        if !path.is_empty() {
            path.push(';');
        }
        path.push_str(entry);
    }
    path
}

/// Directory of the executable named by the first token of `command_line`.
///
/// The first token ends at the first space outside double quotes. If it has
/// no directory part, the root (`\`) is used.
fn executable_dir(command_line: &str) -> String {
    let mut in_quote = false;
    let end = command_line
        .char_indices()
        .find(|&(_, c)| {
            if c == '"' {
                in_quote = !in_quote;
            }
            c == ' ' && !in_quote
        })
        .map_or(command_line.len(), |(index, _)| index);
    let executable = command_line[..end].replace('"', "");

    match executable.rfind(['\\', '/']) {
        Some(0) | None => "\\".to_string(),
        Some(separator) => executable[..=separator].to_string(),
    }
}

/// Command line of the current process.
#[cfg(windows)]
pub fn process_command_line() -> String {
    use windows::Win32::System::Environment::GetCommandLineA;

    // SAFETY: the returned pointer is owned by the process and NUL terminated.
    let command_line = unsafe { GetCommandLineA() };
    if command_line.is_null() {
        return String::new();
    }
    // SAFETY: checked for null above.
    unsafe { String::from_utf8_lossy(command_line.as_bytes()).into_owned() }
}

/// Command line of the current process, with the program name quoted.
#[cfg(not(windows))]
pub fn process_command_line() -> String {
    let mut args = std::env::args_os().map(|arg| arg.to_string_lossy().into_owned());
    let program = args.next().unwrap_or_default();
    std::iter::once(format!("\"{program}\""))
        .chain(args)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod test {

    use std::collections::HashMap;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_should_take_quoted_executable_dir() {
        assert_eq!(
            executable_dir(r#""C:\Program Files\App\app.exe" --flag "x y""#),
            r"C:\Program Files\App\"
        );
        assert_eq!(executable_dir(r"C:\tools\app.exe arg"), r"C:\tools\");
        assert_eq!(executable_dir("/usr/local/bin/app --x"), "/usr/local/bin/");
        assert_eq!(executable_dir("app.exe"), "\\");
    }

    #[test]
    fn test_should_build_search_path() {
        let path = build_search_path(
            r#""C:\App\app.exe" -v"#,
            r"C:\Work",
            env(&[
                ("SYSTEMROOT", r"C:\Windows"),
                ("_NT_SYMBOL_PATH", r#""D:\Symbols";C:\app\"#),
            ]),
        );
        assert_eq!(
            path,
            r"C:\App\;C:\Work;C:\Windows;C:\Windows\system32;D:\Symbols"
        );
    }

    #[test]
    fn test_should_skip_missing_variables() {
        let path = build_search_path("app.exe", ".", env(&[]));
        assert_eq!(path, r"\;.");
        assert!(!path.contains('"'));
    }
}
