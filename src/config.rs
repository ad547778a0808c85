use std::collections::BTreeSet;
use std::path::PathBuf;

/// Encoding of the report text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReportEncoding {
    #[default]
    Ascii,
    /// UTF-16LE report file, with the data dump shown as UTF-16 code units.
    Unicode,
}

/// One import to redirect.
///
/// `importing_module` selects the module whose import table is rewritten;
/// `None` means the main executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchEntry {
    pub importing_module: Option<String>,
    pub export_module: String,
    pub import_name: String,
    pub replacement: usize,
}

impl PatchEntry {
    pub fn new(
        export_module: impl Into<String>,
        import_name: impl Into<String>,
        replacement: usize,
    ) -> Self {
        Self {
            importing_module: None,
            export_module: export_module.into(),
            import_name: import_name.into(),
            replacement,
        }
    }

    /// Scopes the entry to `module` instead of the main executable.
    pub fn in_module(mut self, module: impl Into<String>) -> Self {
        self.importing_module = Some(module.into());
        self
    }
}

/// Engine configuration.
///
/// Set it before the first tracked allocation: the engine takes a snapshot in
/// [`crate::Engine::initialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub max_trace_frames: usize,
    /// 0 disables the data section of the report.
    pub max_data_dump: usize,
    pub show_noise_frames: bool,
    pub ignore_functions: BTreeSet<String>,
    pub patches: Vec<PatchEntry>,
    pub report_file: Option<PathBuf>,
    pub report_to_debugger: bool,
    pub report_encoding: ReportEncoding,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_trace_frames: 64,
            max_data_dump: 256,
            show_noise_frames: false,
            ignore_functions: BTreeSet::new(),
            patches: Vec::new(),
            report_file: None,
            report_to_debugger: true,
            report_encoding: ReportEncoding::Ascii,
        }
    }
}

impl Config {
    pub fn with_max_trace_frames(mut self, frames: usize) -> Self {
        self.max_trace_frames = frames;
        self
    }

    pub fn with_max_data_dump(mut self, bytes: usize) -> Self {
        self.max_data_dump = bytes;
        self
    }

    pub fn with_show_noise_frames(mut self, show: bool) -> Self {
        self.show_noise_frames = show;
        self
    }

    /// Never track allocations whose immediate caller is `function`.
    ///
    /// `function` is the demangled path without the hash suffix, e.g.
    /// `my_crate::cache::fill`.
    pub fn with_ignored_function(mut self, function: impl Into<String>) -> Self {
        self.ignore_functions.insert(function.into());
        self
    }

    pub fn with_patch(mut self, entry: PatchEntry) -> Self {
        self.patches.push(entry);
        self
    }

    pub fn with_report_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_file = Some(path.into());
        self
    }

    pub fn with_report_to_debugger(mut self, enabled: bool) -> Self {
        self.report_to_debugger = enabled;
        self
    }

    pub fn with_report_encoding(mut self, encoding: ReportEncoding) -> Self {
        self.report_encoding = encoding;
        self
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_should_build_config() {
        let config = Config::default()
            .with_max_trace_frames(16)
            .with_max_data_dump(0)
            .with_ignored_function("app::cache::fill")
            .with_patch(PatchEntry::new("msvcrt.dll", "malloc", 0x1000).in_module("plugin.dll"))
            .with_report_encoding(ReportEncoding::Unicode);

        assert_eq!(config.max_trace_frames, 16);
        assert_eq!(config.max_data_dump, 0);
        assert!(config.ignore_functions.contains("app::cache::fill"));
        assert_eq!(config.patches[0].importing_module.as_deref(), Some("plugin.dll"));
        assert_eq!(config.report_encoding, ReportEncoding::Unicode);
        assert!(config.report_to_debugger);
    }
}
