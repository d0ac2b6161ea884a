use std::fmt;

/// Release phase of a PEP 440 version, in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Dev,
    Alpha,
    Beta,
    ReleaseCandidate,
    Final,
    Post,
}

/// A core version normalised for comparison.
///
/// `3.6.0a1` sorts after `3.5.0` and before `3.6.0`; `3.6.0.post1` sorts
/// after `3.6.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub phase: Phase,
    pub phase_number: u64,
}

impl CoreVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            phase: Phase::Final,
            phase_number: 0,
        }
    }

    /// Parses a PEP 440 style version (`3.5.0`, `3.6.0a1`, `3.6.0.dev3`,
    /// `v4.0.0rc2`, `3.6.0.post1+local`). Returns `None` for anything else.
    pub fn parse(raw: &str) -> Option<Self> {
        let s = raw.trim();
        let s = s.strip_prefix(['v', 'V']).unwrap_or(s);
        let s = s.split_once('+').map(|(v, _)| v).unwrap_or(s);

        let release_end = s
            .char_indices()
            .find(|&(i, c)| {
                !(c.is_ascii_digit()
                    || (c == '.' && s[i + 1..].starts_with(|n: char| n.is_ascii_digit())))
            })
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        let (release, suffix) = s.split_at(release_end);
        if release.is_empty() {
            return None;
        }

        let mut nums = release.split('.').map(|p| p.parse::<u64>());
        let major = nums.next()?.ok()?;
        let minor = nums.next().transpose().ok()?.unwrap_or(0);
        let patch = nums.next().transpose().ok()?.unwrap_or(0);
        // Components past the third do not take part in ordering.
        if nums.any(|n| n.is_err()) {
            return None;
        }

        let (phase, phase_number) = parse_suffix(suffix)?;
        Some(Self {
            major,
            minor,
            patch,
            phase,
            phase_number,
        })
    }

    pub fn satisfies(&self, minimum: &CoreVersion) -> bool {
        self >= minimum
    }
}

fn parse_suffix(suffix: &str) -> Option<(Phase, u64)> {
    if suffix.is_empty() {
        return Some((Phase::Final, 0));
    }
    let rest = suffix.strip_prefix(['.', '-', '_']).unwrap_or(suffix);
    let word_end = rest
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(rest.len());
    let (word, rest) = rest.split_at(word_end);
    let phase = match word.to_ascii_lowercase().as_str() {
        "dev" => Phase::Dev,
        "a" | "alpha" => Phase::Alpha,
        "b" | "beta" => Phase::Beta,
        "c" | "rc" | "pre" | "preview" => Phase::ReleaseCandidate,
        "post" | "r" | "rev" => Phase::Post,
        _ => return None,
    };
    if rest.is_empty() {
        return Some((phase, 0));
    }
    let digits = rest.strip_prefix(['.', '-', '_']).unwrap_or(rest);
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let n = digits.parse::<u64>().ok()?;
    Some((phase, n))
}

impl fmt::Display for CoreVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        match self.phase {
            Phase::Final => Ok(()),
            Phase::Dev => write!(f, ".dev{}", self.phase_number),
            Phase::Alpha => write!(f, "a{}", self.phase_number),
            Phase::Beta => write!(f, "b{}", self.phase_number),
            Phase::ReleaseCandidate => write!(f, "rc{}", self.phase_number),
            Phase::Post => write!(f, ".post{}", self.phase_number),
        }
    }
}

impl std::str::FromStr for CoreVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| anyhow::anyhow!("invalid version: {s}"))
    }
}

/// Extracts the version token from `platformio --version` output, e.g.
/// `PlatformIO, version 3.5.0` or `PlatformIO Core, version 6.1.7`.
pub fn version_from_output(stdout: &str) -> Option<&str> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    line.rsplit([' ', '\t']).find(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> CoreVersion {
        CoreVersion::parse(s).unwrap_or_else(|| panic!("parse {s}"))
    }

    #[test]
    fn prerelease_above_minimum_satisfies() {
        assert!(v("3.6.0a1").satisfies(&v("3.5.0")));
        assert!(!v("3.4.9").satisfies(&v("3.5.0")));
        assert!(v("3.5.0").satisfies(&v("3.5.0")));
    }

    #[test]
    fn phases_are_ordered() {
        let ordered = [
            "3.6.0.dev1",
            "3.6.0a1",
            "3.6.0a2",
            "3.6.0b1",
            "3.6.0rc1",
            "3.6.0",
            "3.6.0.post1",
            "3.6.1.dev0",
        ];
        for pair in ordered.windows(2) {
            assert!(v(pair[0]) < v(pair[1]), "{} < {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn short_and_decorated_forms() {
        assert_eq!(v("3.6"), CoreVersion::new(3, 6, 0));
        assert_eq!(v("v4.0.0"), CoreVersion::new(4, 0, 0));
        assert_eq!(v("6.1.7+g1234"), CoreVersion::new(6, 1, 7));
        assert_eq!(v("3.5.0.1"), CoreVersion::new(3, 5, 0));
        assert_eq!(v("3.6.0-rc.2").phase, Phase::ReleaseCandidate);
        assert_eq!(v("3.6.0-rc.2").phase_number, 2);
    }

    #[test]
    fn malformed_versions_do_not_parse() {
        for raw in ["", "abc", "3.x", "3.6.0zeta1", "3.6.0a1b", "..", "3.6.0a-"] {
            assert!(CoreVersion::parse(raw).is_none(), "{raw}");
        }
    }

    #[test]
    fn display_round_trips_through_parse() {
        for raw in ["3.6.0", "3.6.0a1", "3.6.0.dev2", "3.6.0.post1"] {
            assert_eq!(v(raw).to_string(), raw);
        }
    }

    #[test]
    fn version_token_from_cli_output() {
        assert_eq!(version_from_output("PlatformIO, version 3.5.0\n"), Some("3.5.0"));
        assert_eq!(
            version_from_output("\nPlatformIO Core, version 6.1.7a2"),
            Some("6.1.7a2")
        );
        assert_eq!(version_from_output("   \n"), None);
    }
}
