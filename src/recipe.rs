//! What an environment must contain: a runtime version and a list of requirements.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use regex::Regex;
use semver::Version;
use crate::error::{IoContext, PoolError, Result};

static NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(.*)$").unwrap()
});
static EXTRAS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\[([^\]]*)\]\s*(.*)$").unwrap());
static CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(===|==|!=|~=|>=|<=|>|<)\s*([A-Za-z0-9.*+!_-]+)$").unwrap()
});
static MARKER_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^([a-z_]+)\s*(==|!=|>=|<=|>|<|not in|in)\s*(?:'([^']*)'|"([^"]*)")$"#).unwrap()
});
/// `git+https:`, `file:` and the like; two letters at least, so `C:` is a path.
static URL_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]+:").unwrap());

/// Interpreter version an environment is built from, e.g. `3` or `3.11`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuntimeVersion(String);

impl RuntimeVersion {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let valid = !s.is_empty()
            && s
                .split('.')
                .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()));
        if !valid {
            return Err(PoolError::InvalidVersion(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the base interpreter, e.g. `python3.11`.
    pub fn interpreter(&self) -> String {
        format!("python{}", self.0)
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Arbitrary,
    Eq,
    Ne,
    Compatible,
    Ge,
    Le,
    Gt,
    Lt,
}

impl Op {
    fn parse(s: &str) -> Option<Op> {
        Some(match s {
            "===" => Op::Arbitrary,
            "==" => Op::Eq,
            "!=" => Op::Ne,
            "~=" => Op::Compatible,
            ">=" => Op::Ge,
            "<=" => Op::Le,
            ">" => Op::Gt,
            "<" => Op::Lt,
            _ => return None,
        })
    }

    fn as_str(&self) -> &'static str {
        match self {
            Op::Arbitrary => "===",
            Op::Eq => "==",
            Op::Ne => "!=",
            Op::Compatible => "~=",
            Op::Ge => ">=",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Lt => "<",
        }
    }
}

/// One version clause, such as `>=1.0` or `==2.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Specifier {
    pub op: Op,
    pub version: String,
}

impl Specifier {
    /// Whether `installed` satisfies this clause.
    ///
    /// `None` when either side is not a plain release number (up to three numeric
    /// components), since then the answer can't be given with confidence.
    pub fn matches(&self, installed: &str) -> Option<bool> {
        if self.op == Op::Arbitrary {
            return Some(installed == self.version);
        }
        let have = release(installed)?;
        if let Some(prefix) = self.version.strip_suffix(".*") {
            let prefix = components(prefix)?;
            let head = leading(installed, prefix.len())?;
            return match self.op {
                Op::Eq => Some(head == prefix),
                Op::Ne => Some(head != prefix),
                _ => None,
            };
        }
        let want = release(&self.version)?;
        Some(match self.op {
            Op::Eq => have == want,
            Op::Ne => have != want,
            Op::Ge => have >= want,
            Op::Le => have <= want,
            Op::Gt => have > want,
            Op::Lt => have < want,
            Op::Compatible => {
                let parts = components(&self.version)?;
                if parts.len() < 2 {
                    return None;
                }
                let prefix = &parts[..parts.len() - 1];
                let head = leading(installed, prefix.len())?;
                have >= want && head == prefix
            }
            Op::Arbitrary => unreachable!(),
        })
    }
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)
    }
}

fn components(s: &str) -> Option<Vec<u64>> {
    s.split('.').map(|part| part.parse::<u64>().ok()).collect()
}

/// The first `n` release components, zero-padded.
fn leading(s: &str, n: usize) -> Option<Vec<u64>> {
    Some(components(s)?.into_iter().chain(std::iter::repeat(0)).take(n).collect())
}

/// Release number as a semver version, zero-padded: `1.2` is `1.2.0`.
fn release(s: &str) -> Option<Version> {
    let parts = components(s)?;
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let get = |i: usize| parts.get(i).copied().unwrap_or(0);
    Some(Version::new(get(0), get(1), get(2)))
}

/// Normalises a distribution name so `Foo.Bar`, `foo-bar` and `foo_bar` compare equal.
pub fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            pending = true;
            continue;
        }
        if pending && !out.is_empty() {
            out.push('_');
        }
        pending = false;
        out.extend(c.to_lowercase());
    }
    out
}

/// An environment marker such as `python_version >= "3.8" and sys_platform == "linux"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker(String);

impl Marker {
    /// Whether the marker holds for an environment of `runtime` on this platform.
    ///
    /// Only `and`-joined comparisons of `python_version`, `sys_platform`, `os_name` and
    /// `platform_system` are understood; anything else is `None`.
    pub fn evaluate(&self, runtime: &RuntimeVersion) -> Option<bool> {
        if self.0.contains('(') || self.0.split_whitespace().any(|w| w == "or") {
            return None;
        }
        let mut all = true;
        for clause in self.0.split(" and ") {
            let caps = MARKER_CLAUSE.captures(clause.trim())?;
            let value = caps.get(3).or_else(|| caps.get(4))?.as_str();
            all &= match &caps[1] {
                "python_version" => python_version_matches(runtime, &caps[2], value)?,
                "sys_platform" => string_matches(sys_platform(), &caps[2], value)?,
                "os_name" => string_matches(os_name(), &caps[2], value)?,
                "platform_system" => string_matches(platform_system(), &caps[2], value)?,
                _ => return None,
            };
        }
        Some(all)
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn string_matches(actual: &str, op: &str, value: &str) -> Option<bool> {
    Some(match op {
        "==" => actual == value,
        "!=" => actual != value,
        "in" => value.contains(actual),
        "not in" => !value.contains(actual),
        _ => return None,
    })
}

/// `python_version` is `major.minor`. A runtime of just `3` leaves the minor open, so
/// only comparisons that hold for every minor are decided.
fn python_version_matches(runtime: &RuntimeVersion, op: &str, value: &str) -> Option<bool> {
    use std::cmp::Ordering;

    let want = components(value)?;
    if want.is_empty() || want.len() > 2 {
        return None;
    }
    let want_minor = want.get(1).copied().unwrap_or(0);
    let have = components(runtime.as_str())?;
    let (major, rest) = have.split_first()?;
    let ordering = match (major.cmp(&want[0]), rest.first()) {
        (Ordering::Equal, Some(minor)) => minor.cmp(&want_minor),
        (Ordering::Equal, None) => {
            return match op {
                ">=" if want_minor == 0 => Some(true),
                "<" if want_minor == 0 => Some(false),
                _ => None,
            };
        }
        (major, _) => major,
    };
    Some(match op {
        "==" => ordering == Ordering::Equal,
        "!=" => ordering != Ordering::Equal,
        ">=" => ordering != Ordering::Less,
        "<=" => ordering != Ordering::Greater,
        ">" => ordering == Ordering::Greater,
        "<" => ordering == Ordering::Less,
        _ => return None,
    })
}

fn sys_platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
}

fn os_name() -> &'static str {
    if cfg!(windows) { "nt" } else { "posix" }
}

fn platform_system() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "Darwin",
        "windows" => "Windows",
        other => other,
    }
}

/// The target of `-e <target>` / `--editable=<target>`.
fn editable_target(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("--editable").or_else(|| line.strip_prefix("-e"))?;
    Some(rest.trim_start_matches('=').trim())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// A package from the index, with optional extras, version clauses and marker.
    Index {
        name: String,
        extras: Vec<String>,
        specifiers: Vec<Specifier>,
        marker: Option<Marker>,
    },
    /// A local project installed in editable mode (`-e <path>`).
    Local { name: String, path: PathBuf },
    /// Anything else pip understands (URLs, VCS checkouts). Installed verbatim,
    /// but never considered already satisfied.
    Opaque(String),
}

impl Requirement {
    pub fn parse(line: &str) -> Result<Requirement> {
        let line = line.trim();
        if line.is_empty() {
            return Err(PoolError::InvalidRequirement(line.to_string()));
        }
        if let Some(target) = editable_target(line) {
            if target.is_empty() {
                return Err(PoolError::InvalidRequirement(line.to_string()));
            }
            if URL_SCHEME.is_match(target) {
                return Ok(Requirement::Opaque(line.to_string()));
            }
            return Self::local(target);
        }
        if line.starts_with('-') {
            return Err(PoolError::InvalidRequirement(line.to_string()));
        }
        let opaque = || -> Result<Requirement> { Ok(Requirement::Opaque(line.to_string())) };
        let Some(caps) = NAME.captures(line) else {
            return opaque();
        };
        let name = caps[1].to_string();
        let mut rest = caps[2].trim();
        let mut extras = Vec::new();
        if let Some(c) = EXTRAS.captures(rest) {
            extras = c[1]
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .collect();
            rest = c.get(2).map_or("", |m| m.as_str()).trim();
        }
        let (clauses, marker) = match rest.split_once(';') {
            Some((clauses, marker)) if !marker.trim().is_empty() => {
                (clauses.trim(), Some(Marker(marker.trim().to_string())))
            }
            Some(_) => return opaque(),
            None => (rest, None),
        };
        let mut specifiers = Vec::new();
        if !clauses.is_empty() {
            for clause in clauses.split(',') {
                let Some(c) = CLAUSE.captures(clause.trim()) else {
                    return opaque();
                };
                let Some(op) = Op::parse(&c[1]) else {
                    return opaque();
                };
                specifiers.push(Specifier { op, version: c[2].to_string() });
            }
        }
        Ok(Requirement::Index { name, extras, specifiers, marker })
    }

    /// Editable requirement on a local project directory.
    pub fn local<P: AsRef<Path>>(path: P) -> Result<Requirement> {
        let path = std::path::absolute(path.as_ref()).at(path.as_ref())?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PoolError::InvalidRequirement(path.display().to_string()))?
            .to_string();
        Ok(Requirement::Local { name, path })
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Requirement::Index { name, .. } | Requirement::Local { name, .. } => Some(name),
            Requirement::Opaque(_) => None,
        }
    }

    /// `None` if `version` can't be evaluated against every clause.
    pub fn accepts(&self, version: &str) -> Option<bool> {
        match self {
            Requirement::Index { specifiers, .. } => {
                let mut all = true;
                for s in specifiers {
                    all &= s.matches(version)?;
                }
                Some(all)
            }
            _ => None,
        }
    }

    /// Whether pip would install this into an environment of `runtime` at all.
    /// `None` when its marker can't be evaluated.
    pub fn applies_to(&self, runtime: &RuntimeVersion) -> Option<bool> {
        match self {
            Requirement::Index { marker: Some(marker), .. } => marker.evaluate(runtime),
            _ => Some(true),
        }
    }

    /// Arguments for `pip install`.
    pub fn install_args(&self) -> Vec<String> {
        match self {
            Requirement::Local { path, .. } => vec!["-e".to_string(), path.display().to_string()],
            Requirement::Opaque(raw) => match editable_target(raw) {
                Some(target) => vec!["-e".to_string(), target.to_string()],
                None => vec![raw.clone()],
            },
            index => vec![index.to_string()],
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Index { name, extras, specifiers, marker } => {
                f.write_str(name)?;
                if !extras.is_empty() {
                    write!(f, "[{}]", extras.join(","))?;
                }
                let clauses: Vec<String> = specifiers.iter().map(|s| s.to_string()).collect();
                f.write_str(&clauses.join(","))?;
                if let Some(marker) = marker {
                    write!(f, "; {marker}")?;
                }
                Ok(())
            }
            Requirement::Local { path, .. } => write!(f, "-e {}", path.display()),
            Requirement::Opaque(raw) => f.write_str(raw),
        }
    }
}

/// The ordered requirements an environment must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstallRecipe {
    requirements: Vec<Requirement>,
}

impl InstallRecipe {
    pub fn new(requirements: Vec<Requirement>) -> Self {
        Self { requirements }
    }

    /// Parses requirements-file lines; blank lines and `#` comments are skipped.
    pub fn parse<I, S>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut requirements = Vec::new();
        for line in lines {
            let line = line.as_ref();
            let line = match line.find(" #") {
                Some(i) => &line[..i],
                None => line,
            };
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            requirements.push(Requirement::parse(line)?);
        }
        Ok(Self { requirements })
    }

    /// Reads a requirements file, e.g. `requirements.txt`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).at(path.as_ref())?;
        Self::parse(content.lines())
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn install_args(&self) -> Vec<String> {
        self.requirements.iter().flat_map(|r| r.install_args()).collect()
    }
}

impl fmt::Display for InstallRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let all: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "[{}]", all.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(s: &str) -> Specifier {
        match Requirement::parse(&format!("x{s}")).unwrap() {
            Requirement::Index { mut specifiers, .. } => specifiers.remove(0),
            other => panic!("not an index requirement: {other:?}"),
        }
    }

    #[test]
    fn test_runtime_version() {
        assert_eq!(RuntimeVersion::parse("3.11").unwrap().interpreter(), "python3.11");
        assert!(RuntimeVersion::parse("").is_err());
        assert!(RuntimeVersion::parse("3.").is_err());
        assert!(RuntimeVersion::parse("../3").is_err());
    }

    #[test]
    fn test_parse_index_requirement() {
        let req = Requirement::parse("pkgA >= 1.0, <2").unwrap();
        assert_eq!(req.name(), Some("pkgA"));
        assert_eq!(req.to_string(), "pkgA>=1.0,<2");
        assert_eq!(Requirement::parse("six").unwrap().to_string(), "six");
    }

    #[test]
    fn test_parse_extras_and_marker() {
        let req = Requirement::parse("pkgA[extra, other] >=1.0 ; python_version >= '3'").unwrap();
        assert_eq!(req.name(), Some("pkgA"));
        assert_eq!(req.accepts("1.2"), Some(true));
        assert_eq!(req.accepts("0.9"), Some(false));
        assert_eq!(req.to_string(), "pkgA[extra,other]>=1.0; python_version >= '3'");
        assert_eq!(req.install_args(), vec!["pkgA[extra,other]>=1.0; python_version >= '3'"]);

        let bare = Requirement::parse("pkgA[extra]").unwrap();
        assert_eq!(bare.accepts("0.1"), Some(true));
        assert_eq!(bare.applies_to(&RuntimeVersion::parse("3").unwrap()), Some(true));
    }

    #[test]
    fn test_parse_opaque_requirement() {
        let url = Requirement::parse("pkg @ https://example.com/pkg-1.0.tar.gz").unwrap();
        assert!(matches!(url, Requirement::Opaque(_)));
        assert!(matches!(Requirement::parse("pkg>=1;").unwrap(), Requirement::Opaque(_)));
        assert!(Requirement::parse("--index-url x").is_err());
    }

    #[test]
    fn test_editable_vcs_url_is_not_a_path() {
        let req = Requirement::parse("-e git+https://example.com/org/tool.git#egg=tool").unwrap();
        assert_eq!(
            req,
            Requirement::Opaque("-e git+https://example.com/org/tool.git#egg=tool".to_string())
        );
        assert_eq!(req.install_args(), vec!["-e", "git+https://example.com/org/tool.git#egg=tool"]);
        let req = Requirement::parse("--editable=file:///work/tool").unwrap();
        assert_eq!(req.install_args(), vec!["-e", "file:///work/tool"]);
    }

    #[test]
    fn test_python_version_marker() {
        let marker = |m: &str, runtime: &str| {
            let req = Requirement::parse(&format!("pkgA; {m}")).unwrap();
            req.applies_to(&RuntimeVersion::parse(runtime).unwrap())
        };
        assert_eq!(marker("python_version >= '3.8'", "3.11"), Some(true));
        assert_eq!(marker("python_version < '3.8'", "3.11"), Some(false));
        assert_eq!(marker("python_version == \"3.11\"", "3.11.4"), Some(true));
        assert_eq!(marker("python_version < '3'", "2.7"), Some(true));
        assert_eq!(marker("python_version >= '3'", "3"), Some(true));
        assert_eq!(marker("python_version < '3'", "3"), Some(false));
        assert_eq!(marker("python_version >= '3.8'", "3"), None);
        assert_eq!(marker("python_version >= '3.8' and python_version < '4'", "3.9"), Some(true));
        assert_eq!(marker("python_version < '3.8' or python_version > '3.10'", "3.9"), None);
        assert_eq!(marker("implementation_name == 'cpython'", "3.9"), None);
    }

    #[test]
    fn test_platform_marker() {
        let req = Requirement::parse("pkgA; os_name == 'nt'").unwrap();
        let runtime = RuntimeVersion::parse("3").unwrap();
        assert_eq!(req.applies_to(&runtime), Some(cfg!(windows)));
        let req = Requirement::parse("pkgA; sys_platform != 'emscripten'").unwrap();
        assert_eq!(req.applies_to(&runtime), Some(true));
    }

    #[test]
    fn test_parse_local_requirement() {
        let req = Requirement::parse("-e /work/myproj").unwrap();
        assert_eq!(
            req,
            Requirement::Local { name: "myproj".to_string(), path: PathBuf::from("/work/myproj") }
        );
        assert_eq!(req.install_args(), vec!["-e", "/work/myproj"]);
    }

    #[test]
    fn test_specifier_ordering() {
        assert_eq!(spec(">=1.0").matches("1.0"), Some(true));
        assert_eq!(spec(">=1.0").matches("0.9.9"), Some(false));
        assert_eq!(spec("<2").matches("1.10"), Some(true));
        assert_eq!(spec(">1.2").matches("1.10"), Some(true));
        assert_eq!(spec("==1.0").matches("1.0.0"), Some(true));
        assert_eq!(spec("!=1.0").matches("1.0.1"), Some(true));
    }

    #[test]
    fn test_specifier_wildcard_and_compatible() {
        assert_eq!(spec("==2.*").matches("2.7.1"), Some(true));
        assert_eq!(spec("==2.*").matches("3.0"), Some(false));
        assert_eq!(spec("~=1.4").matches("1.9"), Some(true));
        assert_eq!(spec("~=1.4").matches("2.0"), Some(false));
        assert_eq!(spec("~=1.4.2").matches("1.4.5"), Some(true));
        assert_eq!(spec("~=1.4.2").matches("1.5.0"), Some(false));
        assert_eq!(spec("~=1").matches("1.0"), None);
    }

    #[test]
    fn test_specifier_unknown_version_is_none() {
        assert_eq!(spec(">=1.0").matches("1.0rc1"), None);
        assert_eq!(spec(">=1.0").matches("1.2.3.4"), None);
        assert_eq!(spec("===1.0rc1").matches("1.0rc1"), Some(true));
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("Foo.Bar"), "foo_bar");
        assert_eq!(canonical_name("foo--bar"), "foo_bar");
        assert_eq!(canonical_name("zope_interface"), "zope_interface");
    }

    #[test]
    fn test_recipe_skips_comments() {
        let recipe = InstallRecipe::parse(["# tools", "", "pkgA>=1.0  # pinned", "pkgB"]).unwrap();
        assert_eq!(recipe.requirements().len(), 2);
        assert_eq!(recipe.install_args(), vec!["pkgA>=1.0", "pkgB"]);
        assert_eq!(recipe.to_string(), "[pkgA>=1.0, pkgB]");
    }
}
