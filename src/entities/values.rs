//! Labeled pixel values returned by pixel probes.

/// One named value ("R" → "128")
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValuePair {
    pub name: String,
    pub value: String,
}

impl ValuePair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered list of (set title, values)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValuePairListSets {
    sets: Vec<(String, Vec<ValuePair>)>,
}

impl ValuePairListSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, title: impl Into<String>, values: Vec<ValuePair>) {
        self.sets.push((title.into(), values));
    }

    pub fn extend(&mut self, other: ValuePairListSets) {
        self.sets.extend(other.sets);
    }

    /// Rename every set title through `f`
    pub fn map_titles(mut self, f: impl Fn(&str) -> String) -> Self {
        for (title, _) in &mut self.sets {
            *title = f(title);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn titles(&self) -> Vec<&str> {
        self.sets.iter().map(|(t, _)| t.as_str()).collect()
    }

    pub fn get(&self, title: &str) -> Option<&[ValuePair]> {
        self.sets
            .iter()
            .find(|(t, _)| t == title)
            .map(|(_, v)| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Vec<ValuePair>)> {
        self.sets.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_titles() {
        let mut sets = ValuePairListSets::new();
        sets.append("Item A", vec![ValuePair::new("R", "1")]);
        let sets = sets.map_titles(|t| format!("Item 2 - {}", t));
        assert_eq!(sets.titles(), vec!["Item 2 - Item A"]);
        assert_eq!(sets.get("Item 2 - Item A").map(|v| v.len()), Some(1));
    }
}
