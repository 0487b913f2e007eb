use std::path::{Path, PathBuf};

/// `<tool> (-w | -r) [-u <udid>] <ipsw>`
pub fn compose_command(tool: &str, udid: Option<&str>, ipsw: &Path, wipe: bool) -> Vec<String> {
    let mut command = vec![tool.to_string(), if wipe { "-w" } else { "-r" }.to_string()];
    if let Some(udid) = udid.filter(|udid| !udid.is_empty()) {
        command.push("-u".to_string());
        command.push(udid.to_string());
    }
    command.push(ipsw.display().to_string());
    command
}

pub fn sanitize_udid(udid: Option<&str>) -> String {
    match udid {
        Some(udid) if !udid.is_empty() => udid
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-') {
                    ch
                } else {
                    '_'
                }
            })
            .collect(),
        _ => "unknown".to_string(),
    }
}

/// `<log_dir>/<udid>/restore-<timestamp>.log`, made absolute against the
/// working directory.
pub fn restore_log_path(log_dir: &Path, udid: Option<&str>, timestamp: &str) -> PathBuf {
    let path = log_dir
        .join(sanitize_udid(udid))
        .join(format!("restore-{}.log", timestamp));
    std::path::absolute(&path).unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composes_wipe_and_update() {
        assert_eq!(
            compose_command("idevicerestore", Some("AAA"), Path::new("/fw/x.ipsw"), true),
            vec!["idevicerestore", "-w", "-u", "AAA", "/fw/x.ipsw"]
        );
        assert_eq!(
            compose_command("/opt/bin/idevicerestore", None, Path::new("x.ipsw"), false),
            vec!["/opt/bin/idevicerestore", "-r", "x.ipsw"]
        );
    }

    #[test]
    fn sanitizes_identifiers() {
        assert_eq!(sanitize_udid(Some("00008030-001A.b_c")), "00008030-001A.b_c");
        assert_eq!(sanitize_udid(Some("a/b c:d")), "a_b_c_d");
        assert_eq!(sanitize_udid(Some("")), "unknown");
        assert_eq!(sanitize_udid(None), "unknown");
    }

    #[test]
    fn log_path_is_absolute() {
        let path = restore_log_path(Path::new("logs"), Some("a/b"), "20240101-120000");
        assert!(path.is_absolute());
        assert!(path.ends_with("logs/a_b/restore-20240101-120000.log"));
    }
}
