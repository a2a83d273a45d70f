use crate::errors::*;
use std::cmp::Ordering;
use std::fmt;

/// Compare two rpm version strings.
///
/// Strings are walked as alternating runs of digits and letters; every other
/// character is a separator. Numeric runs compare as integers, alphabetic
/// runs lexicographically, and a numeric run always beats an alphabetic one.
/// `~` sorts before everything including the end of the string (pre-release),
/// `^` sorts before everything except the end of the string (post-release).
pub fn rpmvercmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut i = 0;
    let mut j = 0;

    loop {
        while i < a.len() && !is_version_char(a[i]) {
            i += 1;
        }
        while j < b.len() && !is_version_char(b[j]) {
            j += 1;
        }

        let a_tilde = i < a.len() && a[i] == b'~';
        let b_tilde = j < b.len() && b[j] == b'~';
        if a_tilde || b_tilde {
            if !a_tilde {
                return Ordering::Greater;
            }
            if !b_tilde {
                return Ordering::Less;
            }
            i += 1;
            j += 1;
            continue;
        }

        let a_caret = i < a.len() && a[i] == b'^';
        let b_caret = j < b.len() && b[j] == b'^';
        if a_caret || b_caret {
            if !a_caret {
                // caret loses to more characters but beats end-of-string
                return if i < a.len() {
                    Ordering::Greater
                } else {
                    Ordering::Less
                };
            }
            if !b_caret {
                return if j < b.len() {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
            }
            i += 1;
            j += 1;
            continue;
        }

        if i >= a.len() || j >= b.len() {
            break;
        }

        // grab the next run from `a` and a run of the same class from `b`
        let numeric = a[i].is_ascii_digit();
        let start_a = i;
        let start_b = j;
        if numeric {
            while i < a.len() && a[i].is_ascii_digit() {
                i += 1;
            }
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
        } else {
            while i < a.len() && a[i].is_ascii_alphabetic() {
                i += 1;
            }
            while j < b.len() && b[j].is_ascii_alphabetic() {
                j += 1;
            }
        }
        let seg_a = &a[start_a..i];
        let seg_b = &b[start_b..j];

        if seg_b.is_empty() {
            // mismatched run classes: the numeric side is newer
            return if numeric {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        let ord = if numeric {
            let seg_a = trim_leading_zeros(seg_a);
            let seg_b = trim_leading_zeros(seg_b);
            seg_a.len().cmp(&seg_b.len()).then_with(|| seg_a.cmp(seg_b))
        } else {
            seg_a.cmp(seg_b)
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    // every shared run compared equal: leftover characters win
    (a.len() - i).cmp(&(b.len() - j))
}

fn is_version_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'~' || c == b'^'
}

fn trim_leading_zeros(seg: &[u8]) -> &[u8] {
    let n = seg.iter().take_while(|c| **c == b'0').count();
    &seg[n..]
}

/// Compare two (epoch, version, release) triples. A missing epoch counts as
/// `"0"`; an empty release on either side compares equal, so requirements
/// without a release match every build of the right version.
pub fn evr_cmp(a: (&str, &str, &str), b: (&str, &str, &str)) -> Ordering {
    let epoch_a = if a.0.is_empty() { "0" } else { a.0 };
    let epoch_b = if b.0.is_empty() { "0" } else { b.0 };
    rpmvercmp(epoch_a, epoch_b)
        .then_with(|| rpmvercmp(a.1, b.1))
        .then_with(|| {
            if a.2.is_empty() || b.2.is_empty() {
                Ordering::Equal
            } else {
                rpmvercmp(a.2, b.2)
            }
        })
}

/// Version comparison operator attached to a capability entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpFlag {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpFlag {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EQ" => Some(CmpFlag::Eq),
            "LT" => Some(CmpFlag::Lt),
            "LE" => Some(CmpFlag::Le),
            "GT" => Some(CmpFlag::Gt),
            "GE" => Some(CmpFlag::Ge),
            _ => None,
        }
    }

    /// Check a candidate EVR against the constraint EVR under this operator.
    pub fn matches(self, candidate: (&str, &str, &str), want: (&str, &str, &str)) -> bool {
        let ord = evr_cmp(candidate, want);
        match self {
            CmpFlag::Eq => ord == Ordering::Equal,
            CmpFlag::Lt => ord == Ordering::Less,
            CmpFlag::Le => ord != Ordering::Greater,
            CmpFlag::Gt => ord == Ordering::Greater,
            CmpFlag::Ge => ord != Ordering::Less,
        }
    }
}

/// Package identity: name, optional epoch, version, release, arch.
///
/// The canonical textual form is `name-[epoch:]version-release.arch`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Nevra {
    pub name: String,
    pub epoch: Option<String>,
    pub version: String,
    pub release: String,
    pub arch: String,
}

impl Nevra {
    /// Parse the canonical form. Names may contain internal dashes, so the
    /// version and release are split off from the right.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || Error::InvalidArgument(format!("invalid NEVRA string: {s:?}"));

        let (rest, arch) = s.rsplit_once('.').ok_or_else(invalid)?;
        if arch.is_empty() || !arch.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'_') {
            return Err(invalid());
        }

        let (nv, release) = rest.rsplit_once('-').ok_or_else(invalid)?;
        let (name, ev) = nv.rsplit_once('-').ok_or_else(invalid)?;
        let (epoch, version) = match ev.split_once(':') {
            Some((e, v)) => {
                if e.is_empty() || !e.bytes().all(|c| c.is_ascii_digit()) {
                    return Err(invalid());
                }
                (Some(e.to_string()), v)
            }
            None => (None, ev),
        };

        if name.is_empty() || version.is_empty() || release.is_empty() {
            return Err(invalid());
        }
        if !is_name(name) || !is_evr_part(version) || !is_evr_part(release) {
            return Err(invalid());
        }

        Ok(Nevra {
            name: name.to_string(),
            epoch,
            version: version.to_string(),
            release: release.to_string(),
            arch: arch.to_string(),
        })
    }

    /// Infer a NEVRA from an rpm filename like `foo-1.2-3.x86_64.rpm`,
    /// ignoring any leading path components.
    pub fn from_rpm_filename(filename: &str) -> Result<Self> {
        let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
        let base = base.strip_suffix(".rpm").unwrap_or(base);
        Self::parse(base)
    }

    pub fn epoch_num(&self) -> u64 {
        self.epoch
            .as_deref()
            .and_then(|e| e.parse().ok())
            .unwrap_or(0)
    }

    /// `name-version-release`, without epoch and arch.
    pub fn to_nvr(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.release)
    }

    /// Canonical form, identical to `Display`.
    pub fn to_nvra(&self) -> String {
        self.to_string()
    }

    pub fn is_source(&self) -> bool {
        matches!(self.arch.as_str(), "src" | "nosrc")
    }
}

fn is_name(s: &str) -> bool {
    s.bytes()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, b'.' | b'_' | b'+' | b'-'))
}

fn is_evr_part(s: &str) -> bool {
    s.bytes()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, b'.' | b'_' | b'+' | b'~' | b'^'))
}

impl fmt::Display for Nevra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.epoch {
            Some(epoch) => write!(
                f,
                "{}-{}:{}-{}.{}",
                self.name, epoch, self.version, self.release, self.arch
            ),
            None => write!(
                f,
                "{}-{}-{}.{}",
                self.name, self.version, self.release, self.arch
            ),
        }
    }
}

impl Ord for Nevra {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.epoch_num().cmp(&other.epoch_num()))
            .then_with(|| rpmvercmp(&self.version, &other.version))
            .then_with(|| rpmvercmp(&self.release, &other.release))
            .then_with(|| self.arch.cmp(&other.arch))
    }
}

impl PartialOrd for Nevra {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vercmp(a: &str, b: &str) -> i8 {
        match rpmvercmp(a, b) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    #[test]
    fn test_vercmp_equal() {
        assert_eq!(vercmp("1.0", "1.0"), 0);
        assert_eq!(vercmp("1.0.", "1.0"), 0);
        assert_eq!(vercmp("01.00", "1.0"), 0);
    }

    #[test]
    fn test_vercmp_longer_wins() {
        assert_eq!(vercmp("1.0", "1.0.1"), -1);
        assert_eq!(vercmp("1.0.1", "1.0"), 1);
        assert_eq!(vercmp("1a", "1"), 1);
    }

    #[test]
    fn test_vercmp_numeric_not_lexicographic() {
        assert_eq!(vercmp("1.10", "1.9"), 1);
        assert_eq!(vercmp("2.0100", "2.20"), 1);
    }

    #[test]
    fn test_vercmp_numeric_beats_alpha() {
        assert_eq!(vercmp("1.1", "1.a"), 1);
        assert_eq!(vercmp("5.0.post1", "5.0.1"), -1);
    }

    #[test]
    fn test_vercmp_tilde() {
        assert_eq!(vercmp("1.0~rc1", "1.0"), -1);
        assert_eq!(vercmp("1~", "1"), -1);
        assert_eq!(vercmp("1.0~rc1", "1.0~rc2"), -1);
        assert_eq!(vercmp("1.0~rc1~git123", "1.0~rc1"), -1);
    }

    #[test]
    fn test_vercmp_caret() {
        assert_eq!(vercmp("1.0^20230101", "1.0"), 1);
        assert_eq!(vercmp("1.0^", "1.0"), 1);
        assert_eq!(vercmp("1.0^git1", "1.0.1"), -1);
        assert_eq!(vercmp("1.0~rc1^git1", "1.0~rc1"), 1);
    }

    #[test]
    fn test_vercmp_separators_skipped() {
        assert_eq!(vercmp("1.0", "1_0"), 0);
        assert_eq!(vercmp("2.0.1", "2.0.1a"), -1);
    }

    #[test]
    fn test_evr_cmp_release_wildcard() {
        assert_eq!(evr_cmp(("0", "2.0", "1"), ("0", "2.0", "")), Ordering::Equal);
        assert_eq!(evr_cmp(("", "2.0", "1"), ("0", "2.0", "1")), Ordering::Equal);
        assert_eq!(evr_cmp(("1", "1.0", "1"), ("0", "9.0", "1")), Ordering::Greater);
    }

    #[test]
    fn test_cmpflag_matches() {
        let cand = ("0", "2.1", "1.fc41");
        assert!(CmpFlag::Ge.matches(cand, ("0", "2.0", "")));
        assert!(!CmpFlag::Lt.matches(cand, ("0", "2.0", "")));
        assert!(CmpFlag::Eq.matches(cand, ("", "2.1", "")));
        assert!(CmpFlag::Le.matches(("0", "1.9", "1"), ("0", "2.0", "")));
    }

    #[test]
    fn test_parse_simple() {
        let n = Nevra::parse("bash-5.1.12-3.fc39.x86_64").unwrap();
        assert_eq!(n.name, "bash");
        assert_eq!(n.epoch, None);
        assert_eq!(n.version, "5.1.12");
        assert_eq!(n.release, "3.fc39");
        assert_eq!(n.arch, "x86_64");
    }

    #[test]
    fn test_parse_epoch_and_dashed_name() {
        let n = Nevra::parse("gtk4-devel-1:4.12.5-1.el9.aarch64").unwrap();
        assert_eq!(n.name, "gtk4-devel");
        assert_eq!(n.epoch.as_deref(), Some("1"));
        assert_eq!(n.version, "4.12.5");
        assert_eq!(n.release, "1.el9");
        assert_eq!(n.arch, "aarch64");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Nevra::parse("bash").is_err());
        assert!(Nevra::parse("bash-5.1").is_err());
        assert!(Nevra::parse("bash-x:5.1-1.x86_64").is_err());
        assert!(Nevra::parse("bash-5.1-1.").is_err());
        assert!(Nevra::parse("-5.1-1.x86_64").is_err());
    }

    #[test]
    fn test_render_round_trip() {
        for s in [
            "bash-5.1.12-3.fc39.x86_64",
            "gtk4-devel-1:4.12.5-1.el9.aarch64",
            "0ad-0.0.26-21.fc41.src",
            "libstdc++-14.2.1-1.noarch",
        ] {
            let n = Nevra::parse(s).unwrap();
            assert_eq!(n.to_string(), s);
            assert_eq!(Nevra::parse(&n.to_string()).unwrap(), n);
        }
    }

    #[test]
    fn test_from_rpm_filename() {
        let n = Nevra::from_rpm_filename("Packages/0/0ad-0.0.26-21.fc41.src.rpm").unwrap();
        assert_eq!(n.name, "0ad");
        assert!(n.is_source());

        let n = Nevra::from_rpm_filename("bash-5.1.12-3.fc39.x86_64.rpm").unwrap();
        assert_eq!(n.arch, "x86_64");
        assert!(!n.is_source());
    }

    #[test]
    fn test_ordering_chain() {
        let older = Nevra::parse("pkg-1.0-1.x86_64").unwrap();
        let newer = Nevra::parse("pkg-2.0-1.x86_64").unwrap();
        assert!(older < newer);

        let epoch = Nevra::parse("pkg-1:0.1-1.x86_64").unwrap();
        assert!(newer < epoch);

        let pre = Nevra::parse("pkg-2.0~rc1-1.x86_64").unwrap();
        assert!(pre < newer);
    }

    #[test]
    fn test_ordering_totality() {
        let nevras = [
            "a-1.0-1.x86_64",
            "a-1.0-1.noarch",
            "a-1.0-2.x86_64",
            "a-1:0.5-1.x86_64",
            "b-1.0-1.x86_64",
        ]
        .map(|s| Nevra::parse(s).unwrap());

        for x in &nevras {
            for y in &nevras {
                let forward = x.cmp(y);
                assert_eq!(forward.reverse(), y.cmp(x));
            }
        }
    }

    #[test]
    fn test_source_kind() {
        assert!(Nevra::parse("glibc-2.39-5.fc40.src").unwrap().is_source());
        assert!(Nevra::parse("kernel-6.8.0-1.nosrc").unwrap().is_source());
        assert!(!Nevra::parse("glibc-2.39-5.fc40.i686").unwrap().is_source());
    }
}
