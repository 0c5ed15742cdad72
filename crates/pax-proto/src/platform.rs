use std::path::PathBuf;

pub const APP_DIR: &str = "paxradio";

pub const CONTROL_TCP_PORT: u16 = 9877;

pub fn mpv_socket_name() -> String {
    temp_dir().join("paxradio-mpv.sock").display().to_string()
}

pub fn mpv_socket_arg() -> String {
    format!("--input-ipc-server={}", mpv_socket_name())
}

/// `~/.local/share/paxradio/` on every unix, for consistency with the config dir.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".local")
        .join("share")
        .join(APP_DIR)
}

/// `~/.config/paxradio/` (macOS included; no Application Support).
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(APP_DIR)
}

pub fn temp_dir() -> PathBuf {
    std::env::temp_dir()
}

pub fn mpv_binary_name() -> &'static str {
    "mpv"
}

/// Find mpv beside the executable first, then on PATH.
pub fn find_mpv_binary() -> Option<PathBuf> {
    let exe_name = mpv_binary_name();

    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(dir) = current_exe.parent() {
            let local_mpv = dir.join(exe_name);
            if local_mpv.exists() {
                return Some(local_mpv);
            }
        }
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(exe_name))
        .find(|p| p.exists())
}
