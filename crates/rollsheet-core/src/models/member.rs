use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub member_id: String,
    pub display_name: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Member {
    pub fn new(member_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            member_id: member_id.into(),
            display_name: display_name.into(),
            group: None,
            active: true,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Group label for display and grouping, "Ungrouped" when unset
    pub fn group_label(&self) -> &str {
        self.group
            .as_deref()
            .filter(|g| !g.trim().is_empty())
            .unwrap_or("Ungrouped")
    }

    pub fn display_label(&self) -> String {
        match &self.group {
            Some(group) if !group.trim().is_empty() => format!("{} ({})", self.display_name, group),
            _ => self.display_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_label() {
        let m = Member::new("m-1", "Ruth Okafor").with_group("Choir");
        assert_eq!(m.display_label(), "Ruth Okafor (Choir)");
        assert_eq!(m.group_label(), "Choir");

        let plain = Member::new("m-2", "Ade Bello");
        assert_eq!(plain.display_label(), "Ade Bello");
        assert_eq!(plain.group_label(), "Ungrouped");
    }

    #[test]
    fn test_deserialize_defaults_active() {
        let m: Member =
            serde_json::from_str(r#"{"member_id":"m-3","display_name":"Grace"}"#).unwrap();
        assert!(m.active);
        assert_eq!(m.group, None);
    }
}
