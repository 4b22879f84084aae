use crate::error::StampError;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// The three families offered by the stamp font selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FontFamily {
    #[default]
    Helvetica,
    Times,
    Courier,
}

impl FontFamily {
    /// Maps a selector option value; unknown values fall back to Helvetica.
    pub fn from_option(option: &str) -> Self {
        match option.trim().to_ascii_lowercase().as_str() {
            "times" | "times roman" | "times new roman" | "serif" => FontFamily::Times,
            "courier" | "courier new" | "monospace" => FontFamily::Courier,
            _ => FontFamily::Helvetica,
        }
    }

    pub fn option_value(self) -> &'static str {
        match self {
            FontFamily::Helvetica => "helvetica",
            FontFamily::Times => "times",
            FontFamily::Courier => "courier",
        }
    }

    /// Registered family names tried in order.
    fn family_candidates(self) -> &'static [&'static str] {
        match self {
            FontFamily::Helvetica => &[
                "helvetica",
                "arial",
                "liberation sans",
                "nimbus sans",
                "dejavu sans",
            ],
            FontFamily::Times => &[
                "times",
                "times new roman",
                "liberation serif",
                "nimbus roman",
                "dejavu serif",
            ],
            FontFamily::Courier => &[
                "courier",
                "courier new",
                "liberation mono",
                "nimbus mono ps",
                "dejavu sans mono",
            ],
        }
    }

    fn system_file_candidates(self) -> &'static [&'static str] {
        match self {
            FontFamily::Helvetica => &[
                "Helvetica.ttc",
                "arial.ttf",
                "Arial.ttf",
                "LiberationSans-Regular.ttf",
                "NimbusSans-Regular.otf",
                "DejaVuSans.ttf",
                "NotoSans-Regular.ttf",
            ],
            FontFamily::Times => &[
                "Times.ttc",
                "times.ttf",
                "Times New Roman.ttf",
                "LiberationSerif-Regular.ttf",
                "NimbusRoman-Regular.otf",
                "DejaVuSerif.ttf",
            ],
            FontFamily::Courier => &[
                "Courier.ttc",
                "cour.ttf",
                "Courier New.ttf",
                "LiberationMono-Regular.ttf",
                "NimbusMonoPS-Regular.otf",
                "DejaVuSansMono.ttf",
            ],
        }
    }
}

#[derive(Debug)]
pub(crate) struct LoadedFont {
    pub(crate) name: String,
    pub(crate) data: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct FontRegistry {
    fonts: Vec<Arc<LoadedFont>>,
    lookup: HashMap<String, usize>,
    system_fallback: bool,
    system_cache: Mutex<HashMap<FontFamily, Option<Arc<LoadedFont>>>>,
}

impl FontRegistry {
    pub(crate) fn new() -> Self {
        Self {
            fonts: Vec::new(),
            lookup: HashMap::new(),
            system_fallback: true,
            system_cache: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn set_system_fallback(&mut self, enabled: bool) {
        self.system_fallback = enabled;
    }

    pub(crate) fn register_dir(&mut self, path: impl AsRef<Path>) {
        let Ok(entries) = fs::read_dir(path.as_ref()) else {
            log::warn!("font dir {} is not readable", path.as_ref().display());
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                self.register_file(path);
            }
        }
    }

    pub(crate) fn register_file(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if !is_font_path(path) {
            return;
        }
        let Ok(data) = fs::read(path) else {
            return;
        };
        let stem = path.file_stem().and_then(|v| v.to_str());
        if let Err(err) = self.register_bytes(data, stem) {
            log::warn!("skipping font {}: {}", path.display(), err);
        }
    }

    /// Registers a font program; the optional alias is looked up like any
    /// of the names stored in the font itself.
    pub(crate) fn register_bytes(
        &mut self,
        data: Vec<u8>,
        alias: Option<&str>,
    ) -> Result<String, StampError> {
        let (primary, mut aliases) = {
            let face = ttf_parser::Face::parse(&data, 0).map_err(|e| {
                StampError::Font(format!(
                    "invalid font data for {}: {e}",
                    alias.unwrap_or("font")
                ))
            })?;
            font_names(&face)
        };
        let name = primary
            .or_else(|| alias.map(str::to_string))
            .unwrap_or_else(|| format!("font-{}", self.fonts.len() + 1));
        if let Some(alias) = alias {
            aliases.push(alias.to_string());
        }
        let index = self.fonts.len();
        self.fonts.push(Arc::new(LoadedFont {
            name: name.clone(),
            data,
        }));
        for alias in std::iter::once(name.clone()).chain(aliases) {
            let key = normalize_name(&alias);
            if key.is_empty() || self.lookup.contains_key(&key) {
                continue;
            }
            self.lookup.insert(key, index);
        }
        Ok(name)
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<Arc<LoadedFont>> {
        self.lookup
            .get(&normalize_name(name))
            .and_then(|idx| self.fonts.get(*idx))
            .cloned()
    }

    /// Registered fonts first, then the platform font directories.
    pub(crate) fn resolve_family(&self, family: FontFamily) -> Option<Arc<LoadedFont>> {
        for candidate in family.family_candidates() {
            if let Some(font) = self.resolve(candidate) {
                return Some(font);
            }
        }
        if !self.system_fallback {
            return None;
        }
        let Ok(mut cache) = self.system_cache.lock() else {
            return None;
        };
        cache
            .entry(family)
            .or_insert_with(|| load_system_font(family))
            .clone()
    }

    /// Maps a PDF BaseFont name (`ABCDEF+Helvetica-Bold`, `TimesNewRomanPSMT`)
    /// onto a registered font or the closest stamp family.
    pub(crate) fn resolve_pdf_font(&self, base_font: &str) -> Option<Arc<LoadedFont>> {
        let stripped = strip_subset_prefix(base_font);
        if let Some(font) = self.resolve(stripped) {
            return Some(font);
        }
        let lowered = stripped.to_ascii_lowercase();
        let serif = lowered.contains("serif") && !lowered.contains("sans");
        let family = if lowered.contains("times") || serif {
            FontFamily::Times
        } else if lowered.contains("courier") || lowered.contains("mono") {
            FontFamily::Courier
        } else {
            FontFamily::Helvetica
        };
        self.resolve_family(family)
    }
}

fn load_system_font(family: FontFamily) -> Option<Arc<LoadedFont>> {
    let wanted: Vec<String> = family
        .system_file_candidates()
        .iter()
        .map(|name| name.to_ascii_lowercase())
        .collect();
    for dir in system_font_dirs() {
        let mut found: Vec<PathBuf> = Vec::new();
        collect_font_files(&dir, 3, &mut found);
        for candidate in &wanted {
            for path in &found {
                let matches = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.to_ascii_lowercase() == *candidate);
                if !matches {
                    continue;
                }
                let Ok(data) = fs::read(path) else {
                    continue;
                };
                if ttf_parser::Face::parse(&data, 0).is_ok() {
                    log::debug!("{:?} resolved to system font {}", family, path.display());
                    return Some(Arc::new(LoadedFont {
                        name: candidate.clone(),
                        data,
                    }));
                }
            }
        }
    }
    log::warn!("no system font found for {:?}; stamp text will not be drawn", family);
    None
}

fn collect_font_files(dir: &Path, depth: usize, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if depth > 0 {
                collect_font_files(&path, depth - 1, out);
            }
        } else if is_font_path(&path) {
            out.push(path);
        }
    }
}

fn system_font_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    #[cfg(target_os = "windows")]
    {
        dirs.push(PathBuf::from(r"C:\Windows\Fonts"));
        if let Ok(windir) = std::env::var("WINDIR") {
            dirs.push(PathBuf::from(windir).join("Fonts"));
        }
    }

    #[cfg(target_os = "linux")]
    {
        dirs.push(PathBuf::from("/usr/share/fonts"));
        dirs.push(PathBuf::from("/usr/local/share/fonts"));
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(&home).join(".fonts"));
            dirs.push(PathBuf::from(home).join(".local/share/fonts"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        dirs.push(PathBuf::from("/System/Library/Fonts"));
        dirs.push(PathBuf::from("/Library/Fonts"));
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(home).join("Library/Fonts"));
        }
    }

    if let Ok(extra) = std::env::var("PDF_STAMPER_FONT_DIR") {
        for path in std::env::split_paths(&extra) {
            if !path.as_os_str().is_empty() {
                dirs.push(path);
            }
        }
    }

    dirs
}

fn is_font_path(path: &Path) -> bool {
    path.extension()
        .and_then(|v| v.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "ttf" | "otf" | "ttc"))
        .unwrap_or(false)
}

fn font_names(face: &ttf_parser::Face<'_>) -> (Option<String>, Vec<String>) {
    use ttf_parser::name::name_id;

    let mut family = None;
    let mut full = None;
    let mut post = None;

    for entry in face.names() {
        let Some(name) = entry.to_string() else {
            continue;
        };
        match entry.name_id {
            name_id::TYPOGRAPHIC_FAMILY | name_id::FAMILY => {
                if family.is_none() {
                    family = Some(name);
                }
            }
            name_id::FULL_NAME => {
                if full.is_none() {
                    full = Some(name);
                }
            }
            name_id::POST_SCRIPT_NAME => {
                if post.is_none() {
                    post = Some(name);
                }
            }
            _ => {}
        }
    }

    let primary = post.clone().or_else(|| full.clone()).or_else(|| family.clone());
    let aliases = [family, full, post]
        .into_iter()
        .flatten()
        .filter(|candidate| Some(candidate) != primary.as_ref())
        .collect();
    (primary, aliases)
}

fn strip_subset_prefix(name: &str) -> &str {
    let name = name.trim().trim_start_matches('/');
    match name.split_once('+') {
        Some((prefix, rest))
            if prefix.len() == 6 && prefix.chars().all(|c| c.is_ascii_uppercase()) =>
        {
            rest
        }
        _ => name,
    }
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_ascii_lowercase()
}
