use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// On-disk format family of a sorted file. Formats are interchangeable
/// behind the reader/writer contract; the set is closed and known at
/// compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SsTableFormat {
    Flat,
}

impl SsTableFormat {
    pub fn name(self) -> &'static str {
        match self {
            SsTableFormat::Flat => "flat",
        }
    }

    pub fn version(self) -> &'static str {
        match self {
            SsTableFormat::Flat => "1",
        }
    }

    pub fn parse(name: &str, _version: &str) -> Option<Self> {
        match name {
            "flat" => Some(SsTableFormat::Flat),
            _ => None,
        }
    }
}

impl fmt::Display for SsTableFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The files making up one sorted table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Data,
    Index,
    Filter,
    Statistics,
    Toc,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::Data,
        Component::Index,
        Component::Filter,
        Component::Statistics,
        Component::Toc,
    ];

    pub fn file_part(self) -> &'static str {
        match self {
            Component::Data => "Data.db",
            Component::Index => "Index.db",
            Component::Filter => "Filter.db",
            Component::Statistics => "Statistics.db",
            Component::Toc => "TOC.txt",
        }
    }

    pub fn parse(part: &str) -> Option<Self> {
        match part {
            "Data.db" => Some(Component::Data),
            "Index.db" => Some(Component::Index),
            "Filter.db" => Some(Component::Filter),
            "Statistics.db" => Some(Component::Statistics),
            "TOC.txt" => Some(Component::Toc),
            _ => None,
        }
    }
}

/// Identity of a sorted file: its table directory, format, and generation.
/// Generations are monotonic within a table; every component filename is
/// `<format>-<version>-<generation>-<Component>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub dir: PathBuf,
    pub format: SsTableFormat,
    pub generation: u64,
}

impl Descriptor {
    pub fn new(dir: impl Into<PathBuf>, format: SsTableFormat, generation: u64) -> Self {
        Self {
            dir: dir.into(),
            format,
            generation,
        }
    }

    pub fn filename(&self, component: Component) -> String {
        format!(
            "{}-{}-{:08}-{}",
            self.format,
            self.format.version(),
            self.generation,
            component.file_part()
        )
    }

    pub fn path(&self, component: Component) -> PathBuf {
        self.dir.join(self.filename(component))
    }

    /// Parses a component filename back into (descriptor, component).
    pub fn parse(dir: &Path, filename: &str) -> Option<(Descriptor, Component)> {
        let mut parts = filename.splitn(4, '-');
        let format_name = parts.next()?;
        let version = parts.next()?;
        let generation = parts.next()?.parse::<u64>().ok()?;
        let component = Component::parse(parts.next()?)?;
        let format = SsTableFormat::parse(format_name, version)?;
        Some((
            Descriptor {
                dir: dir.to_path_buf(),
                format,
                generation,
            },
            component,
        ))
    }

    /// All generations in `dir` that have a complete component set.
    /// Incomplete sets are left alone; lifecycle-log recovery decides their
    /// fate before this runs.
    pub fn discover(dir: &Path) -> std::io::Result<Vec<Descriptor>> {
        use std::collections::HashMap;
        let mut seen: HashMap<u64, (Descriptor, Vec<Component>)> = HashMap::new();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((desc, component)) = Descriptor::parse(dir, name) {
                seen.entry(desc.generation)
                    .or_insert_with(|| (desc, Vec::new()))
                    .1
                    .push(component);
            }
        }
        let mut complete: Vec<Descriptor> = seen
            .into_values()
            .filter(|(_, components)| {
                Component::ALL.iter().all(|c| components.contains(c))
            })
            .map(|(desc, _)| desc)
            .collect();
        complete.sort_by_key(|d| d.generation);
        Ok(complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_round_trip() {
        let desc = Descriptor::new("/data/ks/t-01", SsTableFormat::Flat, 42);
        let name = desc.filename(Component::Data);
        assert_eq!(name, "flat-1-00000042-Data.db");

        let (parsed, component) = Descriptor::parse(Path::new("/data/ks/t-01"), &name).unwrap();
        assert_eq!(parsed, desc);
        assert_eq!(component, Component::Data);
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        let dir = Path::new("/data");
        assert!(Descriptor::parse(dir, "manifest.json").is_none());
        assert!(Descriptor::parse(dir, "flat-1-zzz-Data.db").is_none());
        assert!(Descriptor::parse(dir, "flat-1-00000001-Nope.db").is_none());
    }

    #[test]
    fn test_discover_requires_complete_set() {
        let tmp = crate::testdir::TempDir::new().unwrap();
        let full = Descriptor::new(tmp.path(), SsTableFormat::Flat, 1);
        for component in Component::ALL {
            std::fs::write(full.path(component), b"x").unwrap();
        }
        let partial = Descriptor::new(tmp.path(), SsTableFormat::Flat, 2);
        std::fs::write(partial.path(Component::Data), b"x").unwrap();

        let found = Descriptor::discover(tmp.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].generation, 1);
    }
}
