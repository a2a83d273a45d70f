use crate::db::{Client, Package, Requirement};
use crate::errors::*;
use crate::nevra::Nevra;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    pub patterns: Vec<String>,
    pub repos: Option<Vec<i64>>,
    pub arch: Option<String>,
    pub recursive: bool,
    pub max_depth: Option<u32>,
    pub include_weak: bool,
    pub include_source: bool,
}

/// Outcome of a resolution. Resolution itself never fails: requirements
/// nobody satisfies end up in `unsatisfied`, request patterns that matched
/// nothing in `not_found`.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Chosen pkgKeys in the order they were settled.
    pub resolved: Vec<i64>,
    pub unsatisfied: BTreeSet<String>,
    pub not_found: Vec<String>,
}

/// Capability-graph closure. Seeds one best candidate per request pattern,
/// then walks strong (and optionally weak) requirements breadth-first,
/// electing a single provider per capability. The `resolved` set breaks
/// dependency cycles.
pub async fn resolve(db: &Client, request: &ResolveRequest) -> Result<Resolution> {
    let repos = request.repos.as_deref();
    let provides = db.provides_map(repos).await?;
    let requires = db.requires_map().await?;

    let mut cache: HashMap<i64, Package> = HashMap::new();
    let mut resolution = Resolution::default();
    let mut resolved: HashSet<i64> = HashSet::new();
    let mut queue: VecDeque<(i64, u32)> = VecDeque::new();

    for pattern in &request.patterns {
        match seed_for_pattern(db, request, pattern).await? {
            Some(package) => {
                queue.push_back((package.pkg_key, 0));
                cache.insert(package.pkg_key, package);
            }
            None => resolution.not_found.push(pattern.clone()),
        }
    }

    while let Some((pkg_key, depth)) = queue.pop_front() {
        if !resolved.insert(pkg_key) {
            continue;
        }
        resolution.resolved.push(pkg_key);

        if !request.recursive {
            continue;
        }
        if let Some(max_depth) = request.max_depth {
            if depth >= max_depth {
                continue;
            }
        }

        let requirements = requires.get(&pkg_key).map(Vec::as_slice).unwrap_or(&[]);
        for requirement in requirements {
            // lint capabilities the package manager itself satisfies
            if requirement.name.starts_with("rpmlib(") {
                continue;
            }
            if requirement.is_weak && !request.include_weak {
                continue;
            }

            match pick_provider(db, request, &provides, &mut cache, requirement).await? {
                Some(winner) => {
                    if !resolved.contains(&winner) {
                        queue.push_back((winner, depth + 1));
                    }
                }
                None => {
                    resolution.unsatisfied.insert(requirement.name.clone());
                }
            }
        }
    }

    Ok(resolution)
}

/// Each request pattern elects at most one seed: exact matches, restricted
/// to literal-name hits when any exist, best candidate by score.
async fn seed_for_pattern(
    db: &Client,
    request: &ResolveRequest,
    pattern: &str,
) -> Result<Option<Package>> {
    let hits = db
        .search_packages(pattern, request.repos.as_deref(), true)
        .await?;
    let mut candidates: Vec<Package> = hits.into_iter().map(|hit| hit.package).collect();

    let exact: Vec<Package> = candidates
        .iter()
        .filter(|p| p.name == pattern)
        .cloned()
        .collect();
    if !exact.is_empty() {
        candidates = exact;
    }

    let wants_source = request.include_source
        || Nevra::parse(pattern)
            .map(|n| n.is_source())
            .unwrap_or(false);
    if !wants_source {
        candidates.retain(|p| !p.is_source());
    }

    Ok(pick_best(candidates, request.arch.as_deref()))
}

async fn pick_provider(
    db: &Client,
    request: &ResolveRequest,
    provides: &HashMap<String, Vec<i64>>,
    cache: &mut HashMap<i64, Package>,
    requirement: &Requirement,
) -> Result<Option<i64>> {
    let mut keys = provides
        .get(&requirement.name)
        .cloned()
        .unwrap_or_default();
    if keys.is_empty() && requirement.name.starts_with('/') {
        keys = db
            .find_file_providers(&requirement.name, request.repos.as_deref())
            .await?;
    }

    let mut candidates = Vec::with_capacity(keys.len());
    for key in keys {
        let package = match cache.get(&key) {
            Some(package) => package.clone(),
            None => {
                let Some(package) = db.get_by_key(key).await? else {
                    continue;
                };
                cache.insert(key, package.clone());
                package
            }
        };
        candidates.push(package);
    }

    if !request.include_source {
        candidates.retain(|p| !p.is_source());
    }
    if let Some(flag) = requirement.cmp_flag() {
        let want = requirement.evr();
        candidates.retain(|p| flag.matches(p.evr(), want));
    }

    Ok(pick_best(candidates, request.arch.as_deref()).map(|p| p.pkg_key))
}

/// Deterministic tie-break: architecture preference first, then the higher
/// NEVRA, then the higher pkgKey for full ties.
pub fn pick_best(candidates: Vec<Package>, arch: Option<&str>) -> Option<Package> {
    candidates.into_iter().max_by(|a, b| {
        arch_preference(&a.arch, arch)
            .cmp(&arch_preference(&b.arch, arch))
            .then_with(|| a.nevra().cmp(&b.nevra()))
            .then_with(|| a.pkg_key.cmp(&b.pkg_key))
    })
}

/// With an explicit arch request, other concrete arches are incompatible and
/// score zero while noarch stays acceptable. Without one, prefer the common
/// 64-bit arch, then noarch, then legacy 32-bit.
fn arch_preference(candidate: &str, wanted: Option<&str>) -> i32 {
    match wanted {
        Some(wanted) => {
            if candidate == wanted {
                100
            } else if candidate == "noarch" {
                40
            } else {
                0
            }
        }
        None => match candidate {
            "x86_64" => 50,
            "noarch" => 40,
            "i686" => 10,
            _ => 0,
        },
    }
}
