//! Canonical names shared by the pipeline, the stores and the HTTP surface.

// Source files and the labels stamped on their rows
pub const RED_SOURCE_FILE: &str = "winequality-red.csv";
pub const WHITE_SOURCE_FILE: &str = "winequality-white.csv";
pub const DATASET_NAMES_FILE: &str = "winequality.names";
pub const RED_LABEL: &str = "red";
pub const WHITE_LABEL: &str = "white";

// Canonical record fields
pub const LABEL_FIELD: &str = "wine_type";
pub const SCORE_FIELD: &str = "quality";
pub const CATEGORY_FIELD: &str = "quality_category";
pub const STATS_FIELD: &str = "alcohol";

/// Physicochemical attributes every staged record carries (after renaming).
pub const DEFAULT_ATTRIBUTES: [&str; 11] = [
    "fixed_acidity",
    "volatile_acidity",
    "citric_acid",
    "residual_sugar",
    "chlorides",
    "free_sulfur_dioxide",
    "total_sulfur_dioxide",
    "density",
    "pH",
    "sulphates",
    "alcohol",
];

// Storage names
pub const STAGING_TABLE: &str = "wine_data";
pub const CURATED_COLLECTION: &str = "wine_collection";
pub const CURATE_CURSOR: &str = "curate";
pub const INLINE_RAW_PREFIX: &str = "api";

// Query limits
pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 1000;

/// Default sources for a scheduled run, as (file name, label).
pub fn default_sources() -> Vec<(&'static str, &'static str)> {
    vec![(RED_SOURCE_FILE, RED_LABEL), (WHITE_SOURCE_FILE, WHITE_LABEL)]
}
