//! Closed code tables for categorical survey fields plus sentinel/derived-value rules.

use std::collections::BTreeMap;

use tracing::warn;

/// Label for a missing code or a code no table lists.
pub const UNKNOWN: &str = "Unknown";

/// Years below this are placeholder codes, not closure years.
pub const PLAUSIBLE_YEAR: i64 = 1000;

/// Stored when an institution reports no athletic conference.
pub const NO_CONFERENCE: i64 = -2;

pub const NO_SYSTEM: &str = "No system";

/// A finite, explicit mapping from survey codes to labels.
pub trait CodeTable: Sized + Copy + 'static {
    /// Source field the table recodes, used in audit output.
    const FIELD: &'static str;
    const ALL: &'static [Self];

    fn lookup(code: i64) -> Option<Self>;
    fn code(self) -> i64;
    fn label(self) -> &'static str;
}

macro_rules! code_table {
    (
        $(#[$meta:meta])*
        $name:ident, $field:literal {
            $($variant:ident = $code:literal => $label:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl CodeTable for $name {
            const FIELD: &'static str = $field;
            const ALL: &'static [Self] = &[$(Self::$variant),+];

            fn lookup(code: i64) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }

            fn code(self) -> i64 {
                match self {
                    $(Self::$variant => $code),+
                }
            }

            fn label(self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }
    };
}

code_table! {
    /// NCES urban-centric locale (`locale`).
    Locale, "locale" {
        CityLarge = 11 => "City: Large",
        CityMidsize = 12 => "City: Midsize",
        CitySmall = 13 => "City: Small",
        SuburbLarge = 21 => "Suburb: Large",
        SuburbMidsize = 22 => "Suburb: Midsize",
        SuburbSmall = 23 => "Suburb: Small",
        TownFringe = 31 => "Town: Fringe",
        TownDistant = 32 => "Town: Distant",
        TownRemote = 33 => "Town: Remote",
        RuralFringe = 41 => "Rural: Fringe",
        RuralDistant = 42 => "Rural: Distant",
        RuralRemote = 43 => "Rural: Remote",
        NotAvailable = -3 => "Not available",
    }
}

code_table! {
    /// Core-based statistical area type (`cbsatype`).
    CbsaType, "cbsatype" {
        Metropolitan = 1 => "Metropolitan Statistical Area",
        Micropolitan = 2 => "Micropolitan Statistical Area",
        NotApplicable = -2 => "Not applicable",
    }
}

code_table! {
    /// Level of institution (`iclevel`).
    InstitutionLevel, "iclevel" {
        FourYear = 1 => "Four or more years",
        TwoYear = 2 => "At least 2 but less than 4 years",
        LessThanTwoYear = 3 => "Less than 2 years (below associate)",
        NotAvailable = -3 => "Not available",
    }
}

code_table! {
    /// Control of institution (`control`).
    Control, "control" {
        Public = 1 => "Public",
        PrivateNonprofit = 2 => "Private not-for-profit",
        PrivateForProfit = 3 => "Private for-profit",
    }
}

code_table! {
    /// Highest level of offering (`hloffer`).
    HighestLevelOffering, "hloffer" {
        LessThanOneYear = 1 => "Award of less than one academic year",
        OneToTwoYears = 2 => "At least 1, but less than 2 academic yrs",
        Associate = 3 => "Associate's degree",
        TwoToFourYears = 4 => "At least 2, but less than 4 academic yrs",
        Bachelor = 5 => "Bachelor's degree",
        PostbaccalaureateCertificate = 6 => "Postbaccalaureate certificate",
        Master = 7 => "Master's degree",
        PostMasterCertificate = 8 => "Post-master's certificate",
        Doctor = 9 => "Doctor's degree",
    }
}

code_table! {
    /// Highest degree offered (`hdegofr1`).
    HighestDegreeOffering, "hdegofr1" {
        DoctorResearchAndProfessional = 11
            => "Doctor's degree - research/scholarship and professional practice",
        DoctorResearch = 12 => "Doctor's degree - research/scholarship",
        DoctorProfessional = 13 => "Doctor's degree - professional practice",
        DoctorOther = 14 => "Doctor's degree - other",
        Master = 20 => "Master's degree",
        Bachelor = 30 => "Bachelor's degree",
        Associate = 40 => "Associate's degree",
        NonDegree = 0 => "Non-degree granting",
    }
}

/// Count of codes that fell to the default label, keyed by (field, raw value).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecodeAudit {
    unmapped: BTreeMap<(&'static str, String), usize>,
}

impl RecodeAudit {
    pub fn record(&mut self, field: &'static str, value: impl ToString) {
        *self.unmapped.entry((field, value.to_string())).or_default() += 1;
    }

    pub fn count(&self, field: &str, value: &str) -> usize {
        self.unmapped
            .iter()
            .find(|((f, v), _)| *f == field && v == value)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.unmapped.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.unmapped.is_empty()
    }

    pub fn merge(&mut self, other: RecodeAudit) {
        for (key, n) in other.unmapped {
            *self.unmapped.entry(key).or_default() += n;
        }
    }

    pub fn log(&self, entity: &str, year: Option<i32>) {
        for ((field, value), rows) in &self.unmapped {
            warn!(entity, ?year, field, value = %value, rows, "unmapped value fell back to default");
        }
    }
}

/// Recode through table `T`; missing and unlisted codes get [`UNKNOWN`], unlisted ones are audited.
pub fn recode<T: CodeTable>(code: Option<i64>, audit: &mut RecodeAudit) -> &'static str {
    match code {
        None => UNKNOWN,
        Some(code) => match T::lookup(code) {
            Some(entry) => entry.label(),
            None => {
                audit.record(T::FIELD, code);
                UNKNOWN
            }
        },
    }
}

/// Numeric geographic codes: negative sentinels and missing values become 0.
pub fn geographic_code(code: Option<i64>) -> i64 {
    code.filter(|c| *c >= 0).unwrap_or(0)
}

/// Single-code boolean: true only when the code equals `truth`.
pub fn flag(code: Option<i64>, truth: i64) -> bool {
    code == Some(truth)
}

/// Parent institution, or the institution itself when no valid parent is recorded.
pub fn parent_or_self(parent: Option<i64>, own: i64) -> i64 {
    parent.filter(|p| *p > 0).unwrap_or(own)
}

pub fn year_closed(value: Option<i64>) -> Option<i64> {
    value.filter(|y| *y >= PLAUSIBLE_YEAR)
}
