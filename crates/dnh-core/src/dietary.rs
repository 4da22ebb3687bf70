//! Dietary and allergen annotations embedded in recipe display names.
//!
//! Names look like `"Grilled Chicken [gf,v] (d,n)"`: the bracket group holds
//! dietary tags, the parenthesis group holds allergens.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DietaryFlags {
    pub vegetarian: bool,
    pub gluten_free: bool,
    pub local: bool,
    pub kosher: bool,
    pub halal: bool,
    pub vegan: bool,
    pub eggs: bool,
    pub fish: bool,
    pub dairy: bool,
    pub tree_nuts: bool,
    pub peanuts: bool,
    pub pork: bool,
    pub soy: bool,
    pub shellfish: bool,
    pub wheat: bool,
}

impl DietaryFlags {
    pub fn from_title(title: &str) -> Self {
        let mut flags = Self::default();
        for token in annotation_tokens(title) {
            flags.apply_token(&token);
        }
        flags
    }

    /// Returns false for tokens outside the known table.
    fn apply_token(&mut self, token: &str) -> bool {
        let slot = match token {
            "v" => &mut self.vegetarian,
            "gf" => &mut self.gluten_free,
            "l" => &mut self.local,
            "k" => &mut self.kosher,
            "h" => &mut self.halal,
            "vg" => &mut self.vegan,
            "e" => &mut self.eggs,
            "f" => &mut self.fish,
            "d" => &mut self.dairy,
            "n" => &mut self.tree_nuts,
            "p" => &mut self.peanuts,
            "pk" => &mut self.pork,
            "s" => &mut self.soy,
            "sf" => &mut self.shellfish,
            "w" => &mut self.wheat,
            _ => return false,
        };
        *slot = true;
        true
    }
}

/// Lower-cased tokens from the first `[...]` group followed by the first `(...)` group.
pub fn annotation_tokens(title: &str) -> Vec<String> {
    [('[', ']'), ('(', ')')]
        .into_iter()
        .filter_map(|(open, close)| first_group(title, open, close))
        .flat_map(|group| {
            group
                .chars()
                .filter(|c| *c != '.' && *c != ' ')
                .collect::<String>()
                .split(',')
                .filter(|token| !token.is_empty())
                .map(str::to_lowercase)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn first_group(title: &str, open: char, close: char) -> Option<&str> {
    let start = title.find(open)? + open.len_utf8();
    let len = title[start..].find(close)?;
    Some(&title[start..start + len])
}

/// Name with both annotation groups cut off: everything before the earlier group start.
pub fn strip_annotations(title: &str) -> &str {
    match (title.find('['), title.find('(')) {
        (Some(a), Some(b)) => &title[..a.min(b)],
        (Some(idx), None) | (None, Some(idx)) => &title[..idx],
        (None, None) => title,
    }
}
