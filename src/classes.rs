//! Class vocabulary for the bias-in-bios corpus
//!
//! Profession ids match the dataset's integer column. Paired classes are
//! synthetic gender/profession groups stored under reserved negative ids.

/// Class key: a profession id (>= 0) or a reserved paired-class id (< 0).
pub type ClassId = i64;

/// Gender column value for male biographies.
pub const MALE: u8 = 0;
/// Gender column value for female biographies.
pub const FEMALE: u8 = 1;

/// Label given to examples of the probed class.
pub const POSITIVE_CLASS_LABEL: u32 = 1;
/// Label given to examples sampled from the other classes.
pub const NEGATIVE_CLASS_LABEL: u32 = 0;

/// Key used for the aggregate entry in held-out probe accuracies.
pub const ALL_PROBES_KEY: ClassId = -1;

/// All male professor + nurse biographies.
pub const MALE_CLASS: ClassId = -2;
/// All female professor + nurse biographies.
pub const FEMALE_CLASS: ClassId = -3;
/// Male + female professors.
pub const PROFESSOR_CLASS: ClassId = -4;
/// Male + female nurses.
pub const NURSE_CLASS: ClassId = -5;

/// Paired classes and the class their probe is contrasted against.
pub const PAIRED_CLASS_KEYS: [(ClassId, ClassId); 4] = [
    (MALE_CLASS, FEMALE_CLASS),
    (FEMALE_CLASS, MALE_CLASS),
    (PROFESSOR_CLASS, NURSE_CLASS),
    (NURSE_CLASS, PROFESSOR_CLASS),
];

/// Professions in dataset id order.
pub const PROFESSIONS: [&str; 28] = [
    "accountant",
    "architect",
    "attorney",
    "chiropractor",
    "comedian",
    "composer",
    "dentist",
    "dietitian",
    "dj",
    "filmmaker",
    "interior_designer",
    "journalist",
    "model",
    "nurse",
    "painter",
    "paralegal",
    "pastor",
    "personal_trainer",
    "photographer",
    "physician",
    "poet",
    "professor",
    "psychologist",
    "rapper",
    "software_engineer",
    "surgeon",
    "teacher",
    "yoga_teacher",
];

/// Look up the id of a profession by name.
pub fn profession_id(name: &str) -> Option<ClassId> {
    PROFESSIONS
        .iter()
        .position(|p| *p == name)
        .map(|i| i as ClassId)
}

/// Look up the name of a class id. Paired classes get their synthetic name.
pub fn class_name(id: ClassId) -> Option<&'static str> {
    match id {
        MALE_CLASS => Some("male"),
        FEMALE_CLASS => Some("female"),
        PROFESSOR_CLASS => Some("professor+"),
        NURSE_CLASS => Some("nurse+"),
        id if id >= 0 => PROFESSIONS.get(id as usize).copied(),
        _ => None,
    }
}

/// The class a paired class is contrasted against, if `id` is a paired class.
pub fn paired_partner(id: ClassId) -> Option<ClassId> {
    PAIRED_CLASS_KEYS
        .iter()
        .find(|(key, _)| *key == id)
        .map(|(_, partner)| *partner)
}

/// Whether `id` is one of the reserved paired-class ids.
pub fn is_paired_class(id: ClassId) -> bool {
    paired_partner(id).is_some()
}

/// Human-readable gender label.
pub fn gender_name(gender: u8) -> &'static str {
    if gender == MALE {
        "Male"
    } else {
        "Female"
    }
}
