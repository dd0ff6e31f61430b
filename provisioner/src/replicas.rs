// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Collision-free names for the replicas of a service.

use std::collections::BTreeSet;

/// Name and hostname of one replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaName {
    pub name: String,
    pub hostname: String,
}

/// Allocates `count` replica identities, suffixing `base_name` and
/// `base_hostname` with `-1`, `-2`, ... (or `-01`, `-02`, ... when
/// `zero_pad` is set).
///
/// Suffixes whose name is already in `existing` are skipped. The search only
/// moves upward, so it terminates however sparse the existing numbering is,
/// and the same snapshot always yields the same names.
pub fn allocate_replicas(
    base_name: &str,
    base_hostname: &str,
    existing: &BTreeSet<String>,
    count: usize,
    zero_pad: bool,
) -> Vec<ReplicaName> {
    let mut replicas: Vec<ReplicaName> = Vec::with_capacity(count);
    let mut suffix: u64 = 1;
    while replicas.len() < count {
        let number = if zero_pad {
            format!("{suffix:02}")
        } else {
            suffix.to_string()
        };
        let candidate = ReplicaName {
            name: format!("{base_name}-{number}"),
            hostname: format!("{base_hostname}-{number}"),
        };
        if !existing.contains(&candidate.name) && !replicas.contains(&candidate)
        {
            replicas.push(candidate);
        }
        suffix += 1;
    }
    replicas
}

#[cfg(test)]
mod test {
    use super::*;

    fn existing(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn names(replicas: &[ReplicaName]) -> Vec<&str> {
        replicas.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn test_skips_existing_names() {
        let replicas =
            allocate_replicas("WEB", "web", &existing(&["WEB-1", "WEB-2"]), 2, false);
        assert_eq!(
            replicas,
            vec![
                ReplicaName {
                    name: String::from("WEB-3"),
                    hostname: String::from("web-3"),
                },
                ReplicaName {
                    name: String::from("WEB-4"),
                    hostname: String::from("web-4"),
                },
            ]
        );
    }

    #[test]
    fn test_fills_gaps() {
        let replicas = allocate_replicas(
            "WEB",
            "web",
            &existing(&["WEB-1", "WEB-3", "WEB-7"]),
            4,
            false,
        );
        assert_eq!(names(&replicas), vec!["WEB-2", "WEB-4", "WEB-5", "WEB-6"]);
    }

    #[test]
    fn test_zero_padding() {
        let replicas =
            allocate_replicas("DB", "db", &existing(&["DB-01"]), 2, true);
        assert_eq!(names(&replicas), vec!["DB-02", "DB-03"]);
        assert_eq!(replicas[0].hostname, "db-02");

        // Unpadded names do not collide with padded ones.
        let replicas = allocate_replicas("DB", "db", &existing(&["DB-1"]), 1, true);
        assert_eq!(names(&replicas), vec!["DB-01"]);
    }

    #[test]
    fn test_deterministic_and_empty() {
        let snapshot = existing(&["APP-2"]);
        assert_eq!(
            allocate_replicas("APP", "app", &snapshot, 3, false),
            allocate_replicas("APP", "app", &snapshot, 3, false)
        );
        assert!(allocate_replicas("APP", "app", &snapshot, 0, false).is_empty());
    }
}
