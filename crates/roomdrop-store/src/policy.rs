use chrono::TimeDelta;

/// Upload extensions refused by default (executables and scripts).
pub const DEFAULT_DENIED_EXTENSIONS: &[&str] = &[
    "php", "exe", "bat", "cmd", "sh", "bin", "jar", "app", "scr", "com", "pif", "vb", "vbs", "js",
    "jse", "wsf", "wsh", "msi", "appx", "dmg", "deb", "rpm",
];

/// Capacity, retention and content limits. All configurable.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_file_size: u64,
    pub max_room_size: u64,
    pub retention: TimeDelta,
    /// In characters, not bytes.
    pub max_message_len: usize,
    /// Lower-case, without the leading dot.
    pub denied_extensions: Vec<String>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            max_room_size: 1024 * 1024 * 1024,
            retention: TimeDelta::hours(24),
            max_message_len: 10_000,
            denied_extensions: DEFAULT_DENIED_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Limits {
    /// False when the filename's extension is on the denylist.
    pub fn is_safe_file_type(&self, filename: &str) -> bool {
        match extension(filename) {
            Some(ext) => !self.denied_extensions.iter().any(|d| d.eq_ignore_ascii_case(&ext)),
            None => true,
        }
    }
}

/// Text after the last dot of the final path component, lower-cased.
fn extension(filename: &str) -> Option<String> {
    let base = display_name(filename);
    base.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase())
}

/// Strip any client-supplied directory components.
pub fn display_name(filename: &str) -> &str {
    filename.rsplit(['/', '\\']).next().unwrap_or(filename)
}

/// Escape markup-significant characters in chat text.
pub fn escape_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denylist_is_case_insensitive() {
        let limits = Limits::default();
        assert!(!limits.is_safe_file_type("setup.EXE"));
        assert!(!limits.is_safe_file_type("run.sh"));
        assert!(!limits.is_safe_file_type("archive.tar.js"));
        assert!(limits.is_safe_file_type("hello.txt"));
        assert!(limits.is_safe_file_type("Makefile"));
        assert!(limits.is_safe_file_type("notes.sh.txt"));
    }

    #[test]
    fn extension_ignores_directories() {
        let limits = Limits::default();
        assert!(limits.is_safe_file_type("dir.exe/readme"));
        assert_eq!(display_name("C:\\Users\\me\\photo.png"), "photo.png");
        assert_eq!(display_name("a/b/c.txt"), "c.txt");
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(
            escape_markup("<b>\"hi\" & 'bye'</b>"),
            "&lt;b&gt;&quot;hi&quot; &amp; &#039;bye&#039;&lt;/b&gt;"
        );
        assert_eq!(escape_markup("plain text"), "plain text");
    }
}
