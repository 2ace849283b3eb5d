use chrono::{DateTime, NaiveDate, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::validation::{self, ValidationErrors};

// ============================================================================
// Identifiers and enumerations
// ============================================================================

/// Identifier assigned by the remote document store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudentId(String);

impl StudentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StudentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for StudentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Others,
}

/// Enrollment status of a student.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Alumni,
    Pursuing,
}

/// Letter grade, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "B+")]
    BPlus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "C+")]
    CPlus,
    #[serde(rename = "C")]
    C,
    #[serde(rename = "D+")]
    DPlus,
    #[serde(rename = "D")]
    D,
    #[serde(rename = "E")]
    E,
}

impl Grade {
    pub const ALL: [Grade; 9] = [
        Grade::APlus,
        Grade::A,
        Grade::BPlus,
        Grade::B,
        Grade::CPlus,
        Grade::C,
        Grade::DPlus,
        Grade::D,
        Grade::E,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::BPlus => "B+",
            Grade::B => "B",
            Grade::CPlus => "C+",
            Grade::C => "C",
            Grade::DPlus => "D+",
            Grade::D => "D",
            Grade::E => "E",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Records
// ============================================================================

/// Every field of a student record except its identifier.
///
/// A profile on its own is a draft: it only becomes a [`Student`] once the
/// remote store has assigned an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentProfile {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub class: String,
    pub section: String,
    pub roll: String,
    pub school: String,
    pub gender: Gender,
    pub status: Status,
    pub grade: Grade,
    pub address: String,
    /// Date of birth. Written as `YYYY-MM-DD`; timestamps are also accepted.
    #[serde(default, deserialize_with = "date_or_timestamp")]
    pub date: Option<NaiveDate>,
}

impl StudentProfile {
    /// Fields the document store keeps as timestamps rather than strings.
    pub const TIMESTAMP_FIELDS: &'static [&'static str] = &["date"];

    /// Check every field the way the add-student form does.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        validation::required(&mut errors, "name", &self.name, "Name is required");
        validation::email(&mut errors, &self.email);
        validation::phone(&mut errors, &self.phone);
        validation::required(&mut errors, "class", &self.class, "Class is required");
        validation::required(&mut errors, "section", &self.section, "Section is required");
        validation::required(&mut errors, "roll", &self.roll, "Roll number is required");
        validation::required(&mut errors, "school", &self.school, "School is required");
        validation::required(&mut errors, "address", &self.address, "Address is required");
        if self.date.is_none() {
            errors.add("date", "Date is required");
        }
        errors.into_result()
    }

    /// JSON object payload as sent to the document store.
    pub fn to_fields(&self) -> serde_json::Result<Map<String, Value>> {
        into_object(serde_json::to_value(self)?)
    }
}

/// A confirmed record: a profile plus its server-assigned identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    #[serde(flatten)]
    pub profile: StudentProfile,
}

impl Student {
    pub fn new(id: StudentId, profile: StudentProfile) -> Self {
        Self { id, profile }
    }

    /// Build a record from a remote document. The document's own id always
    /// wins over any `id` key stored inside its payload.
    pub fn from_document(id: StudentId, fields: Map<String, Value>) -> serde_json::Result<Self> {
        let profile: StudentProfile = serde_json::from_value(Value::Object(fields))?;
        Ok(Self { id, profile })
    }
}

// ============================================================================
// Partial updates
// ============================================================================

/// The subset of fields an update changes. Absent fields stay untouched.
///
/// `date` is doubly optional: `Some(None)` clears the date of birth, `None`
/// leaves it as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roll: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<Grade>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_date"
    )]
    pub date: Option<Option<NaiveDate>>,
}

/// Distinguishes an explicit `null` (clear) from a missing key (keep).
fn present_date<'de, D>(deserializer: D) -> Result<Option<Option<NaiveDate>>, D::Error>
where
    D: Deserializer<'de>,
{
    date_or_timestamp(deserializer).map(Some)
}

fn date_or_timestamp<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|value| parse_date(&value).map_err(D::Error::custom))
        .transpose()
}

/// Parse a date of birth stored either as `YYYY-MM-DD` or as an RFC 3339
/// timestamp. Timestamps are read as their UTC calendar day.
pub fn parse_date(value: &str) -> Result<NaiveDate, String> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc).date_naive())
        .map_err(|_| format!("invalid date {value:?}, expected YYYY-MM-DD or RFC 3339"))
}

impl StudentPatch {
    pub fn is_empty(&self) -> bool {
        self.field_names().is_empty()
    }

    /// Names of the fields this patch sets, in declaration order.
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        let present = [
            ("name", self.name.is_some()),
            ("email", self.email.is_some()),
            ("phone", self.phone.is_some()),
            ("class", self.class.is_some()),
            ("section", self.section.is_some()),
            ("roll", self.roll.is_some()),
            ("school", self.school.is_some()),
            ("gender", self.gender.is_some()),
            ("status", self.status.is_some()),
            ("grade", self.grade.is_some()),
            ("address", self.address.is_some()),
            ("date", self.date.is_some()),
        ];
        for (name, set) in present {
            if set {
                names.push(name);
            }
        }
        names
    }

    /// Shallow-merge the patch into `profile`.
    pub fn apply_to(&self, profile: &mut StudentProfile) {
        if let Some(name) = &self.name {
            profile.name = name.clone();
        }
        if let Some(email) = &self.email {
            profile.email = email.clone();
        }
        if let Some(phone) = &self.phone {
            profile.phone = phone.clone();
        }
        if let Some(class) = &self.class {
            profile.class = class.clone();
        }
        if let Some(section) = &self.section {
            profile.section = section.clone();
        }
        if let Some(roll) = &self.roll {
            profile.roll = roll.clone();
        }
        if let Some(school) = &self.school {
            profile.school = school.clone();
        }
        if let Some(gender) = self.gender {
            profile.gender = gender;
        }
        if let Some(status) = self.status {
            profile.status = status;
        }
        if let Some(grade) = self.grade {
            profile.grade = grade;
        }
        if let Some(address) = &self.address {
            profile.address = address.clone();
        }
        if let Some(date) = self.date {
            profile.date = date;
        }
    }

    /// Validate only the fields the patch sets.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        if let Some(name) = &self.name {
            validation::required(&mut errors, "name", name, "Name is required");
        }
        if let Some(email) = &self.email {
            validation::email(&mut errors, email);
        }
        if let Some(phone) = &self.phone {
            validation::phone(&mut errors, phone);
        }
        if let Some(class) = &self.class {
            validation::required(&mut errors, "class", class, "Class is required");
        }
        if let Some(section) = &self.section {
            validation::required(&mut errors, "section", section, "Section is required");
        }
        if let Some(roll) = &self.roll {
            validation::required(&mut errors, "roll", roll, "Roll number is required");
        }
        if let Some(school) = &self.school {
            validation::required(&mut errors, "school", school, "School is required");
        }
        if let Some(address) = &self.address {
            validation::required(&mut errors, "address", address, "Address is required");
        }
        if let Some(None) = self.date {
            errors.add("date", "Date is required");
        }
        errors.into_result()
    }

    /// JSON object holding only the fields the patch sets.
    pub fn to_fields(&self) -> serde_json::Result<Map<String, Value>> {
        into_object(serde_json::to_value(self)?)
    }
}

impl From<StudentProfile> for StudentPatch {
    /// A patch that overwrites every field, as the edit dialog submits.
    fn from(profile: StudentProfile) -> Self {
        Self {
            name: Some(profile.name),
            email: Some(profile.email),
            phone: Some(profile.phone),
            class: Some(profile.class),
            section: Some(profile.section),
            roll: Some(profile.roll),
            school: Some(profile.school),
            gender: Some(profile.gender),
            status: Some(profile.status),
            grade: Some(profile.grade),
            address: Some(profile.address),
            date: Some(profile.date),
        }
    }
}

fn into_object(value: Value) -> serde_json::Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(serde::de::Error::custom(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

// ============================================================================
// Tests
// ============================================================================
