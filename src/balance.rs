//! Gender-balanced dataset construction
//!
//! Builds, per profession, a group with the same number of male and female
//! biographies, optionally adding the synthetic paired classes.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::seq::{index, SliceRandom};
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::classes::{
    profession_id, ClassId, FEMALE, FEMALE_CLASS, MALE, MALE_CLASS, NURSE_CLASS, PROFESSOR_CLASS,
};
use crate::corpus::{BiasInBios, BioExample, Split, GENDERS};
use crate::error::{ProbeError, Result};

/// Class id -> texts of that class
pub type BalancedGroups = BTreeMap<ClassId, Vec<String>>;

/// Build a gender-balanced group per profession of one split.
///
/// Professions whose smaller gender group has fewer than
/// `min_samples_per_group` examples are left out. Every returned group holds
/// exactly `2 * min_samples_per_group` texts: the male sample followed by the
/// female sample, each drawn with `seed`.
pub fn get_balanced_dataset(
    corpus: &BiasInBios,
    min_samples_per_group: usize,
    split: Split,
    include_paired_classes: bool,
    seed: u64,
) -> Result<BalancedGroups> {
    let examples = corpus.split(split);
    let professions: BTreeSet<ClassId> = examples.iter().map(|e| e.profession).collect();

    let mut balanced = BalancedGroups::new();
    for profession in professions {
        let by_gender: Vec<Vec<&BioExample>> = GENDERS
            .iter()
            .map(|&g| {
                examples
                    .iter()
                    .filter(|e| e.profession == profession && e.gender == g)
                    .collect()
            })
            .collect();

        let min_count = by_gender.iter().map(Vec::len).min().unwrap_or(0);
        if min_count < min_samples_per_group {
            debug!(
                "Skipping profession {profession}: {min_count} < {min_samples_per_group} per gender"
            );
            continue;
        }

        let mut texts = Vec::with_capacity(2 * min_samples_per_group);
        for group in &by_gender {
            // Every gender group is sampled from a generator seeded the same way
            let mut rng = StdRng::seed_from_u64(seed);
            let picked = index::sample(&mut rng, group.len(), min_samples_per_group);
            texts.extend(picked.into_iter().map(|i| group[i].hard_text.clone()));
        }
        balanced.insert(profession, texts);
    }

    if include_paired_classes {
        add_paired_classes(&mut balanced, examples, min_samples_per_group, seed);
    }

    for (class, texts) in &balanced {
        if texts.len() != min_samples_per_group * 2 {
            return Err(ProbeError::Invariant(format!(
                "class {class} has {} texts, expected {}",
                texts.len(),
                min_samples_per_group * 2
            )));
        }
    }

    info!(
        "Balanced {} split: {} classes x {} texts",
        split.name(),
        balanced.len(),
        min_samples_per_group * 2
    );
    Ok(balanced)
}

/// Add the male / female / professor / nurse paired classes.
///
/// Each is built from the first `min_count` examples of the relevant
/// (profession, gender) cells, where `min_count` is the smallest cell size
/// capped at `cutoff`, then shuffled with a generator seeded by `seed`.
/// Skipped when professor or nurse is absent from the split.
fn add_paired_classes(
    balanced: &mut BalancedGroups,
    examples: &[BioExample],
    cutoff: usize,
    seed: u64,
) {
    let (Some(professor), Some(nurse)) = (profession_id("professor"), profession_id("nurse"))
    else {
        return;
    };

    let cell = |profession: ClassId, gender: u8| -> Vec<String> {
        examples
            .iter()
            .filter(|e| e.profession == profession && e.gender == gender)
            .map(|e| e.hard_text.clone())
            .collect()
    };

    let male_nurse = cell(nurse, MALE);
    let female_nurse = cell(nurse, FEMALE);
    let male_professor = cell(professor, MALE);
    let female_professor = cell(professor, FEMALE);

    let professor_present = !male_professor.is_empty() || !female_professor.is_empty();
    let nurse_present = !male_nurse.is_empty() || !female_nurse.is_empty();
    if !professor_present || !nurse_present {
        warn!("Professor or nurse missing from split, not adding paired classes");
        return;
    }

    let min_count = [
        male_nurse.len(),
        female_nurse.len(),
        male_professor.len(),
        female_professor.len(),
        cutoff,
    ]
    .into_iter()
    .min()
    .unwrap_or(0);

    let head = |texts: &[String]| texts[..min_count].to_vec();
    let concat = |a: &[String], b: &[String]| [head(a), head(b)].concat();

    let mut male_combined = concat(&male_professor, &male_nurse);
    let mut female_combined = concat(&female_professor, &female_nurse);
    let mut professors_combined = concat(&male_professor, &female_professor);
    let mut nurses_combined = concat(&male_nurse, &female_nurse);

    let mut rng = StdRng::seed_from_u64(seed);
    male_combined.shuffle(&mut rng);
    female_combined.shuffle(&mut rng);
    professors_combined.shuffle(&mut rng);
    nurses_combined.shuffle(&mut rng);

    balanced.insert(MALE_CLASS, male_combined);
    balanced.insert(FEMALE_CLASS, female_combined);
    balanced.insert(PROFESSOR_CLASS, professors_combined);
    balanced.insert(NURSE_CLASS, nurses_combined);
}

/// Drop every class that is not present in both maps.
pub fn ensure_shared_keys(
    mut train: BalancedGroups,
    mut test: BalancedGroups,
) -> (BalancedGroups, BalancedGroups) {
    let test_only: Vec<ClassId> = test
        .keys()
        .filter(|k| !train.contains_key(k))
        .copied()
        .collect();
    let train_only: Vec<ClassId> = train
        .keys()
        .filter(|k| !test.contains_key(k))
        .copied()
        .collect();

    for key in test_only {
        warn!("Removing {key} from test set");
        test.remove(&key);
    }
    for key in train_only {
        warn!("Removing {key} from train set");
        train.remove(&key);
    }

    (train, test)
}

/// Balanced train and test groups with a shared class set.
///
/// Each split's per-gender minimum is a quarter of the requested set size.
pub fn get_train_test_data(
    corpus: &BiasInBios,
    train_set_size: usize,
    test_set_size: usize,
    include_paired_classes: bool,
    seed: u64,
) -> Result<(BalancedGroups, BalancedGroups)> {
    let minimum_train_samples = train_set_size / 4;
    let minimum_test_samples = test_set_size / 4;

    let train = get_balanced_dataset(
        corpus,
        minimum_train_samples,
        Split::Train,
        include_paired_classes,
        seed,
    )?;
    let test = get_balanced_dataset(
        corpus,
        minimum_test_samples,
        Split::Test,
        include_paired_classes,
        seed,
    )?;

    Ok(ensure_shared_keys(train, test))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_split(professions: &[ClassId], per_cell: usize, tag: &str) -> Vec<BioExample> {
        let mut rows = Vec::new();
        for &profession in professions {
            for gender in GENDERS {
                for i in 0..per_cell {
                    rows.push(BioExample {
                        hard_text: format!("{tag}-{profession}-{gender}-{i}"),
                        profession,
                        gender,
                    });
                }
            }
        }
        rows
    }

    fn corpus(professions: &[ClassId], per_cell: usize) -> BiasInBios {
        BiasInBios::new(
            synthetic_split(professions, per_cell, "train"),
            synthetic_split(professions, per_cell, "test"),
        )
    }

    #[test]
    fn test_balanced_groups_have_equal_gender_counts() {
        let corpus = corpus(&[0, 1, 2], 30);
        let groups = get_balanced_dataset(&corpus, 10, Split::Train, false, 42).unwrap();

        assert_eq!(groups.len(), 3);
        for (profession, texts) in &groups {
            assert_eq!(texts.len(), 20);
            let male = texts
                .iter()
                .filter(|t| t.starts_with(&format!("train-{profession}-0-")))
                .count();
            assert_eq!(male, 10);
            // Male sample first, then female sample
            assert!(texts[..10].iter().all(|t| t.contains(&format!("-{profession}-0-"))));
        }
    }

    #[test]
    fn test_balancing_is_deterministic() {
        let corpus = corpus(&[0, 13, 21], 40);
        let a = get_balanced_dataset(&corpus, 15, Split::Train, true, 7).unwrap();
        let b = get_balanced_dataset(&corpus, 15, Split::Train, true, 7).unwrap();
        assert_eq!(a, b);

        let c = get_balanced_dataset(&corpus, 15, Split::Train, true, 8).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_underpopulated_profession_is_skipped() {
        let mut train = synthetic_split(&[0, 1], 20, "train");
        // Profession 5 has plenty of men and too few women
        train.extend(synthetic_split(&[5], 20, "train").into_iter().filter(|e| {
            e.gender == MALE || e.hard_text.ends_with("-0") || e.hard_text.ends_with("-1")
        }));
        let corpus = BiasInBios::new(train, vec![]);

        let groups = get_balanced_dataset(&corpus, 10, Split::Train, false, 42).unwrap();
        assert_eq!(groups.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_single_gender_profession_is_skipped() {
        let train: Vec<BioExample> = synthetic_split(&[3], 20, "train")
            .into_iter()
            .filter(|e| e.gender == FEMALE)
            .collect();
        let corpus = BiasInBios::new(train, vec![]);
        let groups = get_balanced_dataset(&corpus, 5, Split::Train, false, 42).unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_four_professions_with_paired_classes() {
        let corpus = corpus(&[0, 1, 13, 21], 50);
        let groups = get_balanced_dataset(&corpus, 50, Split::Train, true, 42).unwrap();

        let keys: Vec<ClassId> = groups.keys().copied().collect();
        assert_eq!(keys, vec![-5, -4, -3, -2, 0, 1, 13, 21]);
        assert!(groups.values().all(|texts| texts.len() == 100));

        let male = &groups[&MALE_CLASS];
        assert!(male.iter().all(|t| t.contains("-0-")));
        let nurses = &groups[&NURSE_CLASS];
        assert!(nurses.iter().all(|t| t.starts_with("train-13-")));
    }

    #[test]
    fn test_paired_classes_need_professor_and_nurse() {
        let corpus = corpus(&[0, 1, 2, 3], 50);
        let groups = get_balanced_dataset(&corpus, 50, Split::Train, true, 42).unwrap();
        assert_eq!(groups.len(), 4);
        assert!(groups.keys().all(|k| *k >= 0));
    }

    #[test]
    fn test_paired_classes_smaller_than_cutoff_break_invariant() {
        let mut train = synthetic_split(&[0, 21], 50, "train");
        train.extend(synthetic_split(&[13], 10, "train"));
        let corpus = BiasInBios::new(train, vec![]);

        let err = get_balanced_dataset(&corpus, 50, Split::Train, true, 42).unwrap_err();
        assert!(matches!(err, ProbeError::Invariant(_)));
    }

    #[test]
    fn test_ensure_shared_keys() {
        let train: BalancedGroups = [(0, vec!["a".into()]), (1, vec!["b".into()])].into();
        let test: BalancedGroups = [(1, vec!["c".into()]), (2, vec!["d".into()])].into();

        let (train, test) = ensure_shared_keys(train, test);
        assert_eq!(train.keys().collect::<Vec<_>>(), vec![&1]);
        assert_eq!(test.keys().collect::<Vec<_>>(), vec![&1]);
        assert_eq!(train[&1], vec!["b".to_string()]);
    }

    #[test]
    fn test_train_test_data_share_keys() {
        let corpus = BiasInBios::new(
            synthetic_split(&[0, 1, 2], 30, "train"),
            synthetic_split(&[1, 2, 4], 30, "test"),
        );
        let (train, test) = get_train_test_data(&corpus, 80, 40, false, 42).unwrap();

        assert_eq!(
            train.keys().collect::<BTreeSet<_>>(),
            test.keys().collect::<BTreeSet<_>>()
        );
        assert_eq!(train.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert!(train.values().all(|t| t.len() == 40));
        assert!(test.values().all(|t| t.len() == 20));
    }
}
