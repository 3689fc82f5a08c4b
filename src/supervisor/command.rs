//! Launch command construction for `llama-server`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::types::config::LaunchOptions;
use crate::types::model::ModelEntry;

/// Library locations of a self-contained ROCm install, searched after the binary dir.
const ROCM_LIBRARY_DIRS: &[&str] = &[
    "/opt/rocm-7.2.0/lib",
    "/opt/rocm-7.2.0/lib64",
    "/opt/rocm/lib",
    "/opt/rocm/lib64",
    "/usr/local/rocm/lib",
    "/usr/local/rocm/lib64",
    "/usr/local/lib64",
    "/usr/local/lib",
];

/// Fully resolved command line for one inference server
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra environment, applied on top of the inherited one
    pub env: Vec<(String, OsString)>,
}

impl LaunchCommand {
    /// `bin_dir` is the configured install; `options.llama_bin_dir` takes
    /// precedence over it for this launch.
    pub fn build(bin_dir: Option<&Path>, entry: &ModelEntry, options: &LaunchOptions, port: u16) -> Self {
        let mut bin_dirs: Vec<&Path> = options.llama_bin_dir.as_deref().into_iter().collect();
        if let Some(dir) = bin_dir {
            if !bin_dirs.contains(&dir) {
                bin_dirs.push(dir);
            }
        }
        let program = server_executable(bin_dirs.first().copied());

        let mut args: Vec<String> = vec!["-m".into(), entry.path.to_string_lossy().into_owned()];

        if options.enable_vision {
            if let Some(mmproj) = &entry.mmproj {
                args.push("--mmproj".into());
                args.push(mmproj.file_path.to_string_lossy().into_owned());
            }
        }

        args.extend(["--host".into(), "127.0.0.1".into(), "--port".into(), port.to_string()]);

        let numeric = [
            ("-c", options.ctx_size),
            ("-ngl", options.gpu_layers),
            ("-t", options.threads),
            ("-b", options.batch_size),
            ("-ub", options.ubatch_size),
            ("-np", options.parallel),
        ];
        for (flag, value) in numeric {
            if let Some(v) = value {
                args.push(flag.into());
                args.push(v.to_string());
            }
        }

        if let Some(fa) = options.flash_attention {
            args.push("-fa".into());
            args.push(if fa { "on" } else { "off" }.into());
        }
        if options.no_mmap {
            args.push("--no-mmap".into());
        }
        if options.mlock {
            args.push("--mlock".into());
        }
        if options.jinja {
            args.push("--jinja".into());
        }
        if !entry.alias.is_empty() {
            args.push("--alias".into());
            args.push(entry.alias.clone());
        }

        args.extend(split_command_line(&options.extra_args));

        let env = library_path_env(&bin_dirs, std::env::var_os(library_path_var()))
            .map(|value| vec![(library_path_var().to_string(), value)])
            .unwrap_or_default();

        Self { program, args, env }
    }

    /// Command line as a single string, for logs and process listings
    pub fn display(&self) -> String {
        let mut line = quote_arg(&self.program.to_string_lossy());
        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote_arg(arg));
        }
        line
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

fn server_executable(bin_dir: Option<&Path>) -> PathBuf {
    let name = if cfg!(windows) { "llama-server.exe" } else { "llama-server" };
    match bin_dir {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(char::is_whitespace) {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Name of the dynamic library search path variable on this platform
pub fn library_path_var() -> &'static str {
    if cfg!(windows) {
        "PATH"
    } else if cfg!(target_os = "macos") {
        "DYLD_LIBRARY_PATH"
    } else {
        "LD_LIBRARY_PATH"
    }
}

/// New value for the library search path: the binary directories in order
/// (and ROCm locations on Linux) ahead of whatever was already set.
pub fn library_path_env(bin_dirs: &[&Path], existing: Option<OsString>) -> Option<OsString> {
    let mut entries: Vec<PathBuf> = bin_dirs.iter().map(|dir| dir.to_path_buf()).collect();
    if cfg!(target_os = "linux") {
        entries.extend(ROCM_LIBRARY_DIRS.iter().map(PathBuf::from));
    }
    if entries.is_empty() {
        return None;
    }

    if let Some(existing) = existing {
        for path in std::env::split_paths(&existing) {
            if !path.as_os_str().is_empty() && !entries.contains(&path) {
                entries.push(path);
            }
        }
    }

    std::env::join_paths(entries).ok()
}

/// Split a command line into arguments with shell-like quoting.
///
/// Double quotes group everywhere; single quotes group except on Windows.
/// Inside a quoted section a backslash only escapes the active quote
/// character and is kept literally otherwise.
pub fn split_command_line(line: &str) -> Vec<String> {
    split_with_quotes(line, !cfg!(windows))
}

fn split_with_quotes(line: &str, allow_single: bool) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut has_token = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = line.trim().chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' && (in_double || (allow_single && in_single)) {
            let quote = if in_double { '"' } else { '\'' };
            if chars.peek() == Some(&quote) {
                cur.push(quote);
                chars.next();
            } else {
                cur.push(c);
            }
            continue;
        }

        if c == '"' && !in_single {
            in_double = !in_double;
            has_token = true;
            continue;
        }
        if allow_single && c == '\'' && !in_double {
            in_single = !in_single;
            has_token = true;
            continue;
        }

        if !in_single && !in_double && c.is_whitespace() {
            if has_token {
                out.push(std::mem::take(&mut cur));
                has_token = false;
            }
            continue;
        }

        cur.push(c);
        has_token = true;
    }
    if has_token {
        out.push(cur);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::model::ModelContainerMetadata;

    fn entry(alias: &str, with_mmproj: bool) -> ModelEntry {
        let meta = |name: &str| ModelContainerMetadata {
            file_name: name.into(),
            file_path: PathBuf::from("/models/qwen").join(name),
            architecture: Some("qwen3".into()),
            context_length: Some(40960),
        };
        ModelEntry {
            model_id: "Qwen3-0.6B-Q8_0-0123abcd".into(),
            name: "Qwen3-0.6B-Q8_0".into(),
            alias: alias.into(),
            primary: meta("Qwen3-0.6B-Q8_0.gguf"),
            mmproj: with_mmproj.then(|| meta("mmproj-F16.gguf")),
            size: 1024,
            path: PathBuf::from("/models/qwen/Qwen3-0.6B-Q8_0.gguf"),
        }
    }

    #[test]
    fn test_minimal_command() {
        let cmd = LaunchCommand::build(
            Some(Path::new("/opt/llama")),
            &entry("", false),
            &LaunchOptions {
                jinja: false,
                ..Default::default()
            },
            8081,
        );
        assert!(cmd.program.starts_with("/opt/llama"));
        assert_eq!(
            cmd.args,
            vec![
                "-m",
                "/models/qwen/Qwen3-0.6B-Q8_0.gguf",
                "--host",
                "127.0.0.1",
                "--port",
                "8081"
            ]
        );
    }

    #[test]
    fn test_full_command() {
        let options = LaunchOptions {
            ctx_size: Some(8192),
            gpu_layers: Some(99),
            flash_attention: Some(true),
            no_mmap: true,
            extra_args: r#"--temp 0.7 --chat-template-kwargs "{\"enable_thinking\": false}""#.into(),
            ..Default::default()
        };
        let cmd = LaunchCommand::build(None, &entry("qwen", true), &options, 8090);

        let args = cmd.args.join(" ");
        assert!(args.contains("--mmproj /models/qwen/mmproj-F16.gguf"));
        assert!(args.contains("-c 8192"));
        assert!(args.contains("-ngl 99"));
        assert!(args.contains("-fa on"));
        assert!(args.contains("--no-mmap"));
        assert!(args.contains("--jinja"));
        assert!(args.contains("--alias qwen"));
        assert_eq!(cmd.args.last().map(String::as_str), Some(r#"{"enable_thinking": false}"#));
    }

    #[test]
    fn test_vision_disabled_skips_projector() {
        let options = LaunchOptions {
            enable_vision: false,
            ..Default::default()
        };
        let cmd = LaunchCommand::build(None, &entry("", true), &options, 8081);
        assert!(!cmd.args.iter().any(|a| a == "--mmproj"));
    }

    #[test]
    fn test_split_quoting() {
        assert_eq!(split_with_quotes("  a  b\tc ", true), vec!["a", "b", "c"]);
        assert_eq!(split_with_quotes(r#"--x "a b" c"#, true), vec!["--x", "a b", "c"]);
        assert_eq!(split_with_quotes(r#"'it''s' x"#, true), vec!["its", "x"]);
        assert_eq!(split_with_quotes(r#""say \"hi\"""#, true), vec![r#"say "hi""#]);
        assert_eq!(split_with_quotes(r#""C:\dir\file""#, true), vec![r"C:\dir\file"]);
        assert_eq!(split_with_quotes(r#""""#, true), vec![""]);
        assert!(split_with_quotes("   ", true).is_empty());
    }

    #[test]
    fn test_split_single_quotes_literal_when_disallowed() {
        assert_eq!(split_with_quotes("'a b'", false), vec!["'a", "b'"]);
    }

    #[test]
    fn test_library_path_prepends_bin_dir_and_keeps_existing() {
        let existing = std::env::join_paths(["/usr/lib/custom", "/opt/llama"]).unwrap();
        let value = library_path_env(&[Path::new("/opt/llama")], Some(existing)).unwrap();
        let parts: Vec<PathBuf> = std::env::split_paths(&value).collect();

        assert_eq!(parts.first(), Some(&PathBuf::from("/opt/llama")));
        assert_eq!(parts.last(), Some(&PathBuf::from("/usr/lib/custom")));
        assert_eq!(parts.iter().filter(|p| *p == Path::new("/opt/llama")).count(), 1);
    }

    #[test]
    fn test_per_load_bin_dir_overrides_configured() {
        let options = LaunchOptions {
            llama_bin_dir: Some(PathBuf::from("/opt/llama-vulkan")),
            ..Default::default()
        };
        let cmd = LaunchCommand::build(Some(Path::new("/opt/llama")), &entry("", false), &options, 8081);
        assert!(cmd.program.starts_with("/opt/llama-vulkan"));

        let (var, value) = cmd.env.first().unwrap();
        assert_eq!(var, library_path_var());
        let parts: Vec<PathBuf> = std::env::split_paths(value).collect();
        assert_eq!(parts[0], PathBuf::from("/opt/llama-vulkan"));
        assert_eq!(parts[1], PathBuf::from("/opt/llama"));
    }

    #[test]
    fn test_per_load_bin_dir_without_configured_dir() {
        let options = LaunchOptions {
            llama_bin_dir: Some(PathBuf::from("/opt/llama-cuda")),
            ..Default::default()
        };
        let cmd = LaunchCommand::build(None, &entry("", false), &options, 8081);
        assert!(cmd.program.starts_with("/opt/llama-cuda"));
        let parts: Vec<PathBuf> = std::env::split_paths(&cmd.env[0].1).collect();
        assert_eq!(parts.first(), Some(&PathBuf::from("/opt/llama-cuda")));
    }

    #[test]
    fn test_display_quotes_spaces() {
        let cmd = LaunchCommand {
            program: PathBuf::from("/opt/llama server/llama-server"),
            args: vec!["-m".into(), "/m/a b.gguf".into()],
            env: Vec::new(),
        };
        assert_eq!(cmd.display(), r#""/opt/llama server/llama-server" -m "/m/a b.gguf""#);
    }
}
