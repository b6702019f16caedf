//! Boot Loader Specification entries under `boot/loader/entries`
//!
//! one entry per deployment; the highest `version` is the default.

use std::fmt;

use super::kargs::BootArguments;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub title: String,
    /// 1-based boot order, higher wins
    pub version: u32,
    pub options: BootArguments,
    pub linux: Option<String>,
    pub initrd: Option<String>,
}

impl BootEntry {
    /// `ostree-<version>-<osname>.conf`
    pub fn file_name(&self, osname: &str) -> String {
        format!("ostree-{}-{}.conf", self.version, osname)
    }

    /// parse an entry file; unknown keys and comments are ignored
    pub fn parse(input: &str) -> Result<Self, String> {
        let mut title = None;
        let mut version = None;
        let mut options = None;
        let mut linux = None;
        let mut initrd = None;

        for line in input.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once(char::is_whitespace)
                .map(|(k, v)| (k, v.trim()))
                .unwrap_or((line, ""));
            match key {
                "title" => title = Some(value.to_string()),
                "version" => {
                    version = Some(
                        value
                            .parse::<u32>()
                            .map_err(|_| format!("invalid version {:?}", value))?,
                    )
                }
                "options" => options = Some(BootArguments::parse(value)),
                "linux" => linux = Some(value.to_string()),
                "initrd" => initrd = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            title: title.unwrap_or_default(),
            version: version.ok_or("missing version")?,
            options: options.ok_or("missing options")?,
            linux,
            initrd,
        })
    }
}

impl fmt::Display for BootEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "title {}", self.title)?;
        writeln!(f, "version {}", self.version)?;
        if let Some(linux) = &self.linux {
            writeln!(f, "linux {}", linux)?;
        }
        if let Some(initrd) = &self.initrd {
            writeln!(f, "initrd {}", initrd)?;
        }
        writeln!(f, "options {}", self.options)
    }
}
