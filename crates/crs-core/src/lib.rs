//! Core domain model and natural-key derivation for CRS.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "crs-core";

/// Defaults substituted when the source omits a value.
pub const DEFAULT_PROGRAMME_TYPE: &str = "Standard";
pub const DEFAULT_MATERIAL_TYPE: &str = "Slide Deck";
pub const DEFAULT_COHORT: &str = "Default";
pub const DEFAULT_PATHWAY_STATUS: &str = "Active";
pub const DEFAULT_VERSION_LABEL: &str = "v1.0";
pub const DEFAULT_VERSION_STATUS: &str = "Open";
pub const DEFAULT_DELIVERY_METHOD: &str = "Virtual";

/// Constants the outbound sheet shape always carries, independent of what was
/// stored on create. The round-trip is lossy for these columns.
pub const EXPORT_MATERIAL_TYPE: &str = "Slide Deck";
pub const EXPORT_DELIVERY_METHOD: &str = "Virtual";

/// One denormalized sheet row after adapter coercion. Every column is
/// optional; an absent cell is `None`, never an empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetRow {
    pub client_name: Option<String>,
    pub programme: Option<String>,
    pub cohort: Option<String>,
    pub module_no: Option<String>,
    pub module_name: Option<String>,
    pub class_no: Option<String>,
    pub class_name: Option<String>,
    pub material_type: Option<String>,
    pub version: Option<String>,
    pub status: Option<String>,
    pub delivery_method: Option<String>,
    pub notes: Option<String>,
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgrammeKey(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleKey {
    pub programme: ProgrammeKey,
    pub module_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassKey {
    pub module: ModuleKey,
    pub class_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathwayKey {
    pub client: ClientKey,
    pub programme: ProgrammeKey,
    pub cohort: String,
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for ProgrammeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.programme, self.module_name)
    }
}

impl std::fmt::Display for ClassKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.module, self.class_name)
    }
}

impl std::fmt::Display for PathwayKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}::{}", self.client, self.programme, self.cohort)
    }
}

impl SheetRow {
    pub fn client_key(&self) -> Option<ClientKey> {
        non_empty(self.client_name.as_deref()).map(|s| ClientKey(s.to_string()))
    }

    pub fn programme_key(&self) -> Option<ProgrammeKey> {
        non_empty(self.programme.as_deref()).map(|s| ProgrammeKey(s.to_string()))
    }

    pub fn module_key(&self) -> Option<ModuleKey> {
        let programme = self.programme_key()?;
        let module_name = non_empty(self.module_name.as_deref())?;
        Some(ModuleKey {
            programme,
            module_name: module_name.to_string(),
        })
    }

    pub fn class_key(&self) -> Option<ClassKey> {
        let module = self.module_key()?;
        let class_name = non_empty(self.class_name.as_deref())?;
        Some(ClassKey {
            module,
            class_name: class_name.to_string(),
        })
    }

    pub fn pathway_key(&self) -> Option<PathwayKey> {
        let client = self.client_key()?;
        let programme = self.programme_key()?;
        Some(PathwayKey {
            client,
            programme,
            cohort: self.cohort_or_default().to_string(),
        })
    }

    pub fn cohort_or_default(&self) -> &str {
        non_empty(self.cohort.as_deref()).unwrap_or(DEFAULT_COHORT)
    }

    pub fn version_label(&self) -> &str {
        non_empty(self.version.as_deref()).unwrap_or(DEFAULT_VERSION_LABEL)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// First run of decimal digits in a free-text label, e.g. "Class 3" -> 3.
pub fn extract_rank(label: &str) -> Option<i32> {
    let start = label.find(|c: char| c.is_ascii_digit())?;
    let digits: String = label[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Human-readable external reference for a content version: three-character
/// prefixes of the client, module and class names plus the version label,
/// uppercased and stripped of whitespace. Generated once at insert; the store
/// never looks records up by it.
pub fn version_code(
    client_name: &str,
    module_name: &str,
    class_name: &str,
    version_label: &str,
) -> String {
    let code = format!(
        "{}-{}-{}-{}",
        name_prefix(client_name),
        name_prefix(module_name),
        name_prefix(class_name),
        version_label
    );
    code.chars().filter(|c| !c.is_whitespace()).collect()
}

fn name_prefix(name: &str) -> String {
    name.chars().take(3).collect::<String>().to_uppercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub client_id: Uuid,
    pub client_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Programme {
    pub programme_id: Uuid,
    pub programme_name: String,
    pub programme_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub module_id: Uuid,
    pub programme_id: Uuid,
    pub module_number: Option<i32>,
    pub module_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Class {
    pub class_id: Uuid,
    pub module_id: Uuid,
    pub class_number: Option<i32>,
    pub class_name: String,
    pub material_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pathway {
    pub pathway_id: Uuid,
    pub client_id: Uuid,
    pub programme_id: Uuid,
    pub cohort_name: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentVersion {
    pub version_id: Uuid,
    pub class_id: Uuid,
    pub pathway_id: Uuid,
    pub version_code: String,
    pub version_number: String,
    pub status: String,
    pub drive_link: Option<String>,
    pub delivery_method: String,
    pub notes: Option<String>,
}

/// A content version joined with its full ancestor chain
/// (class -> module -> programme; pathway -> client), fetched as one read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentVersionDetail {
    pub version: ContentVersion,
    pub class_name: String,
    pub class_number: Option<i32>,
    pub module_name: String,
    pub module_number: Option<i32>,
    pub programme_name: String,
    pub cohort_name: String,
    pub client_name: String,
}

/// The flat shape pushed back to the external sheet. Every column is always
/// present; absent optionals become empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetExport {
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Client Name")]
    pub client_name: String,
    #[serde(rename = "Programme")]
    pub programme: String,
    #[serde(rename = "Cohort")]
    pub cohort: String,
    #[serde(rename = "Module No.")]
    pub module_no: String,
    #[serde(rename = "Module Name")]
    pub module_name: String,
    #[serde(rename = "Class No.")]
    pub class_no: String,
    #[serde(rename = "Type")]
    pub material_type: String,
    #[serde(rename = "Class Name")]
    pub class_name: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Delivery Method")]
    pub delivery_method: String,
    #[serde(rename = "Delivery Date")]
    pub delivery_date: String,
    #[serde(rename = "Notes")]
    pub notes: String,
    #[serde(rename = "Link")]
    pub link: String,
    #[serde(rename = "Version Code")]
    pub version_code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_with(
        client: Option<&str>,
        programme: Option<&str>,
        module: Option<&str>,
        class: Option<&str>,
    ) -> SheetRow {
        SheetRow {
            client_name: client.map(ToString::to_string),
            programme: programme.map(ToString::to_string),
            module_name: module.map(ToString::to_string),
            class_name: class.map(ToString::to_string),
            ..SheetRow::default()
        }
    }

    #[test]
    fn rank_extraction_takes_first_digit_run() {
        assert_eq!(extract_rank("Class 3"), Some(3));
        assert_eq!(extract_rank("Module 12b rev 4"), Some(12));
        assert_eq!(extract_rank("7"), Some(7));
        assert_eq!(extract_rank("no digits here"), None);
        assert_eq!(extract_rank(""), None);
    }

    #[test]
    fn absent_or_empty_fields_yield_no_identity() {
        let row = row_with(None, Some("Leadership"), Some("M1"), Some("Intro"));
        assert!(row.client_key().is_none());
        assert!(row.pathway_key().is_none());
        assert!(row.module_key().is_some());

        let blank = row_with(Some("   "), Some(""), Some("M1"), Some("Intro"));
        assert!(blank.client_key().is_none());
        assert!(blank.programme_key().is_none());
        assert!(blank.module_key().is_none());
        assert!(blank.class_key().is_none());
    }

    #[test]
    fn keys_are_trimmed_and_chain_through_parents() {
        let row = row_with(Some(" Acme "), Some("Leadership"), Some("M1"), Some("Intro"));
        assert_eq!(row.client_key().unwrap().0, "Acme");
        let class = row.class_key().unwrap();
        assert_eq!(class.class_name, "Intro");
        assert_eq!(class.module.module_name, "M1");
        assert_eq!(class.module.programme.0, "Leadership");
    }

    #[test]
    fn pathway_cohort_falls_back_to_default() {
        let row = row_with(Some("Acme"), Some("Leadership"), None, None);
        assert_eq!(row.pathway_key().unwrap().cohort, DEFAULT_COHORT);

        let mut cohorted = row_with(Some("Acme"), Some("Leadership"), None, None);
        cohorted.cohort = Some("Spring 2025".to_string());
        assert_eq!(cohorted.pathway_key().unwrap().cohort, "Spring 2025");
    }

    #[test]
    fn version_label_defaults_when_absent() {
        let mut row = row_with(Some("Acme"), Some("Leadership"), Some("M1"), Some("Intro"));
        assert_eq!(row.version_label(), DEFAULT_VERSION_LABEL);
        row.version = Some("v2.0".to_string());
        assert_eq!(row.version_label(), "v2.0");
    }

    #[test]
    fn version_code_uses_uppercased_prefixes() {
        assert_eq!(version_code("Acme", "M1", "Intro", "v1.0"), "ACM-M1-INT-v1.0");
        assert_eq!(
            version_code("acme corp", "Module One", "intro", "v2.0"),
            "ACM-MOD-INT-v2.0"
        );
    }

    #[test]
    fn version_code_strips_all_whitespace() {
        // A space inside the first three characters survives the prefix cut
        // but not the final strip.
        assert_eq!(version_code("A B Corp", "M 1", "Intro", "v1.0"), "AB-M1-INT-v1.0");
        assert_eq!(version_code("A B Corp", "M 1", "In tro", "v1.0"), "AB-M1-IN-v1.0");
    }

    #[test]
    fn key_display_joins_segments() {
        let row = row_with(Some("Acme"), Some("Leadership"), Some("M1"), Some("Intro"));
        assert_eq!(row.class_key().unwrap().to_string(), "Leadership::M1::Intro");
        assert_eq!(
            row.pathway_key().unwrap().to_string(),
            "Acme::Leadership::Default"
        );
    }
}
