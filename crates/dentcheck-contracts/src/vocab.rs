use indexmap::IndexMap;

/// Fixed damage vocabulary, in prompt order. The model is instructed to pick
/// from exactly these labels; anything else is an upstream quality problem.
pub const DAMAGE_CATEGORIES: [&str; 9] = [
    "Broken Glass",
    "Broken Lights",
    "Scratch",
    "Dent",
    "Crack",
    "Punctured Tyre",
    "Lost Parts",
    "Torn",
    "Non-Damaged",
];

/// Case-insensitive lookup over the fixed vocabulary, insertion-ordered so
/// listings match the prompt text.
#[derive(Debug, Clone)]
pub struct CategoryRegistry {
    categories: IndexMap<String, String>,
}

impl CategoryRegistry {
    pub fn new() -> Self {
        let mut categories = IndexMap::new();
        for name in DAMAGE_CATEGORIES {
            categories.insert(name.to_ascii_lowercase(), name.to_string());
        }
        Self { categories }
    }

    pub fn names(&self) -> Vec<String> {
        self.categories.values().cloned().collect()
    }

    pub fn canonicalize(&self, label: &str) -> Option<&str> {
        self.categories
            .get(&label.trim().to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_known(&self, label: &str) -> bool {
        self.canonicalize(label).is_some()
    }

    /// Labels in `damage_type` that are outside the vocabulary. Callers turn
    /// these into warnings, never errors; taxonomy is decided upstream.
    pub fn unknown_labels(&self, labels: &[String]) -> Vec<String> {
        labels
            .iter()
            .filter(|label| !self.is_known(label))
            .cloned()
            .collect()
    }
}

impl Default for CategoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
