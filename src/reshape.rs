//! Wide-to-long reshaping of course exports.
//!
//! Course CSVs carry one row per student with a column family per subject
//! slot: `SUB1` (subject code), `SUB1NM` (subject name) and `SUB1_<METRIC>`
//! (marks, grade, credit and so on). Reshaping produces one row per student
//! per occupied slot, keyed by field name, with the slot position discarded.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::models::{REGN_NO, SUBJECT_CODE, SUBJECT_NAME};
use crate::table::WideTable;

pub const SUBJECT_PREFIX: &str = "SUB";

const ACTUAL_CODE_STUB: &str = "SUBJECT_ACTUAL_CODE";
const SHADOW_SUFFIX: &str = "_GLOBAL";

/// Metric families pivoted out of the subject slots.
pub const STUB_NAMES: [&str; 14] = [
    "SUBJECT_NAME",
    "TH_MRKS",
    "CE_MRKS",
    "TOT",
    "GRADE",
    "GRADE_POINTS",
    "CREDIT",
    "CREDIT_POINTS",
    "TYPE",
    "RESULT",
    ACTUAL_CODE_STUB,
    "MONTH_YEAR_COMPLETION",
    "YEAR_COMPLETION",
    "MONTH_COMPLETION_IN_NUMBER",
];

/// Stub name to the field name stored in the table-store.
const FIELD_RENAMES: [(&str, &str); 6] = [
    (ACTUAL_CODE_STUB, SUBJECT_CODE),
    ("TOT", "Marks"),
    ("GRADE", "Grade"),
    ("MONTH_YEAR_COMPLETION", "Month_Year_Completion"),
    ("YEAR_COMPLETION", "Academic_Year"),
    ("MONTH_COMPLETION_IN_NUMBER", "Academic_Month"),
];

/// One reshaped row; missing cells are simply absent.
pub type LongRow = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReshapeError {
    #[error("required column {0} is missing from the CSV")]
    MissingColumn(String),
    #[error("no subject columns found (expected SUB<n>, SUB<n>NM or SUB<n>_<METRIC>)")]
    NoSubjectColumns,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReshapeReport {
    pub identifiers: Vec<String>,
    pub positions: Vec<u32>,
    /// Identifier columns that share a name with a metric family.
    pub shadowed: Vec<String>,
    pub malformed: Vec<String>,
    pub blank_slots: usize,
}

#[derive(Debug, Clone)]
pub struct ReshapeOutcome {
    pub rows: Vec<LongRow>,
    pub report: ReshapeReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ColumnKind {
    Identifier,
    Metric {
        metric: String,
        position: u32,
        /// Digits as written, so `SUB01` and `SUB1` can be told apart.
        spelling: String,
    },
    Malformed,
}

#[derive(Debug)]
struct IdentifierColumn {
    index: usize,
    name: String,
    shadow: Option<String>,
}

#[derive(Debug)]
struct MetricColumn {
    index: usize,
    field: String,
    position: u32,
}

pub fn reshape(table: &WideTable) -> Result<ReshapeOutcome, ReshapeError> {
    let mut report = ReshapeReport::default();
    let mut identifiers: Vec<IdentifierColumn> = Vec::new();
    let mut metrics: Vec<MetricColumn> = Vec::new();
    let mut spellings: BTreeMap<u32, String> = BTreeMap::new();

    for (index, header) in table.headers.iter().enumerate() {
        match classify(header) {
            ColumnKind::Identifier => {
                let shadow = STUB_NAMES
                    .contains(&header.as_str())
                    .then(|| format!("{header}{SHADOW_SUFFIX}"));
                identifiers.push(IdentifierColumn {
                    index,
                    name: header.clone(),
                    shadow,
                });
            }
            ColumnKind::Metric {
                metric,
                position,
                spelling,
            } => {
                let first = spellings.entry(position).or_insert_with(|| spelling.clone());
                if *first != spelling {
                    warn!(
                        column = %header,
                        position,
                        first = %first,
                        "subject position written two ways; ignored"
                    );
                    report.malformed.push(header.clone());
                    continue;
                }
                let canonical = format!("{metric}_{position}");
                debug!(column = %header, canonical = %canonical, "subject column");
                metrics.push(MetricColumn {
                    index,
                    field: field_name(&metric),
                    position,
                });
            }
            ColumnKind::Malformed => {
                warn!(column = %header, "subject column has a malformed position; ignored");
                report.malformed.push(header.clone());
            }
        }
    }

    let regn_index = table
        .column_index(REGN_NO)
        .ok_or_else(|| ReshapeError::MissingColumn(REGN_NO.to_string()))?;
    identifiers.retain(|column| column.index != regn_index);
    identifiers.insert(
        0,
        IdentifierColumn {
            index: regn_index,
            name: REGN_NO.to_string(),
            shadow: None,
        },
    );

    report.identifiers = identifiers.iter().map(|column| column.name.clone()).collect();
    report.shadowed = identifiers
        .iter()
        .filter_map(|column| column.shadow.clone())
        .collect();
    debug!(identifiers = ?report.identifiers, shadowed = ?report.shadowed, "identifier columns");

    if metrics.is_empty() {
        return Err(ReshapeError::NoSubjectColumns);
    }

    let positions: BTreeSet<u32> = metrics.iter().map(|column| column.position).collect();
    report.positions = positions.iter().copied().collect();

    let mut rows = Vec::new();
    for cells in table.rows.iter() {
        // Shadowed identifiers stay under their shadow name through the slot
        // merge so a pivoted field of the same name cannot overwrite them.
        let mut base = LongRow::new();
        for column in identifiers.iter() {
            if let Some(Some(value)) = cells.get(column.index) {
                let key = column.shadow.as_ref().unwrap_or(&column.name);
                base.insert(key.clone(), value.clone());
            }
        }

        for position in positions.iter() {
            let mut slot = LongRow::new();
            for column in metrics.iter().filter(|column| column.position == *position) {
                if let Some(Some(value)) = cells.get(column.index) {
                    slot.entry(column.field.clone()).or_insert_with(|| value.clone());
                }
            }

            if !slot.contains_key(SUBJECT_NAME) && !slot.contains_key(SUBJECT_CODE) {
                report.blank_slots += 1;
                continue;
            }

            let mut row = base.clone();
            row.extend(slot);
            restore_shadowed(&mut row, &identifiers);
            rows.push(row);
        }
    }

    debug!(
        rows = rows.len(),
        positions = report.positions.len(),
        blank_slots = report.blank_slots,
        "reshape complete"
    );

    Ok(ReshapeOutcome { rows, report })
}

/// Moves shadowed identifiers back to their own name; a pivoted value
/// already under that name wins.
fn restore_shadowed(row: &mut LongRow, identifiers: &[IdentifierColumn]) {
    for column in identifiers.iter() {
        if let Some(shadow) = &column.shadow {
            if let Some(value) = row.remove(shadow) {
                row.entry(column.name.clone()).or_insert(value);
            }
        }
    }
}

fn classify(column: &str) -> ColumnKind {
    if let Some(rest) = column.strip_prefix(SUBJECT_PREFIX) {
        if rest.starts_with(|c: char| c.is_ascii_digit()) {
            return classify_subject_column(rest);
        }
    }

    match split_position(column) {
        Some((stem, digits, position)) if STUB_NAMES.contains(&stem) => ColumnKind::Metric {
            metric: stem.to_string(),
            position,
            spelling: digits.to_string(),
        },
        _ => ColumnKind::Identifier,
    }
}

/// `rest` is the column name after the prefix and starts with a digit.
fn classify_subject_column(rest: &str) -> ColumnKind {
    let (digits, metric) = match rest.split_once('_') {
        Some((digits, metric)) => (digits, metric),
        None => match rest.strip_suffix("NM") {
            Some(digits) => (digits, SUBJECT_NAME),
            None => (rest, ACTUAL_CODE_STUB),
        },
    };

    match parse_position(digits) {
        Some(position) if !metric.is_empty() => ColumnKind::Metric {
            metric: metric.to_string(),
            position,
            spelling: digits.to_string(),
        },
        _ => ColumnKind::Malformed,
    }
}

fn split_position(column: &str) -> Option<(&str, &str, u32)> {
    let (stem, digits) = column.rsplit_once('_')?;
    Some((stem, digits, parse_position(digits)?))
}

fn parse_position(digits: &str) -> Option<u32> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn field_name(metric: &str) -> String {
    FIELD_RENAMES
        .iter()
        .find(|(stub, _)| *stub == metric)
        .map(|(_, field)| field.to_string())
        .unwrap_or_else(|| metric.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(csv: &str) -> WideTable {
        WideTable::from_reader(csv.as_bytes()).unwrap()
    }

    #[test]
    fn splits_subject_slots_into_rows() {
        let input = table(
            "REGN_NO,SUB1,SUB1NM,SUB1_TOT,SUB1_GRADE,SUB2,SUB2NM,SUB2_TOT,SUB2_GRADE\n\
             AU21UG-001,101,Maths,88,A,102,Physics,75,B\n",
        );

        let outcome = reshape(&input).unwrap();
        assert_eq!(outcome.rows.len(), 2);

        let maths = &outcome.rows[0];
        assert_eq!(maths["REGN_NO"], "AU21UG-001");
        assert_eq!(maths["SUBJECT_CODE"], "101");
        assert_eq!(maths["SUBJECT_NAME"], "Maths");
        assert_eq!(maths["Marks"], "88");
        assert_eq!(maths["Grade"], "A");

        let physics = &outcome.rows[1];
        assert_eq!(physics["REGN_NO"], "AU21UG-001");
        assert_eq!(physics["SUBJECT_CODE"], "102");
        assert_eq!(physics["SUBJECT_NAME"], "Physics");
        assert_eq!(physics["Marks"], "75");
        assert_eq!(physics["Grade"], "B");
    }

    #[test]
    fn blank_slots_are_dropped() {
        let input = table(
            "REGN_NO,CNAME,SUB1,SUB1NM,SUB1_TOT,SUB2,SUB2NM,SUB2_TOT,SUB3,SUB3NM,SUB3_TOT\n\
             AU21UG-001,Avery,101,Maths,88,102,Physics,75,103,Design,91\n\
             AU21UG-002,Jules,101,Maths,64,,,,,,\n",
        );

        let outcome = reshape(&input).unwrap();
        let per_student: Vec<usize> = ["AU21UG-001", "AU21UG-002"]
            .iter()
            .map(|regn| outcome.rows.iter().filter(|r| r["REGN_NO"] == *regn).count())
            .collect();

        assert_eq!(per_student, vec![3, 1]);
        assert_eq!(outcome.report.blank_slots, 2);
        assert!(outcome.rows.iter().all(|row| !row["CNAME"].is_empty()));
    }

    #[test]
    fn slot_with_only_a_name_is_kept() {
        let input = table("REGN_NO,SUB1,SUB1NM,SUB1_TOT\nAU21UG-001,,Seminar,\n");
        let outcome = reshape(&input).unwrap();

        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0]["SUBJECT_NAME"], "Seminar");
        assert!(!outcome.rows[0].contains_key("SUBJECT_CODE"));
    }

    #[test]
    fn positions_need_not_be_contiguous() {
        let input = table("REGN_NO,SUB1,SUB1NM,SUB4,SUB4NM\nAU21UG-001,101,Maths,104,Ethics\n");
        let outcome = reshape(&input).unwrap();

        assert_eq!(outcome.report.positions, vec![1, 4]);
        let codes: Vec<&str> = outcome
            .rows
            .iter()
            .map(|row| row["SUBJECT_CODE"].as_str())
            .collect();
        assert_eq!(codes, vec!["101", "104"]);
    }

    #[test]
    fn completion_fields_get_business_names() {
        let input = table(
            "REGN_NO,SUB1,SUB1_MONTH_YEAR_COMPLETION,SUB1_YEAR_COMPLETION,SUB1_MONTH_COMPLETION_IN_NUMBER,SUB1_CREDIT_POINTS\n\
             AU21UG-001,101,May 2023,2023,5,32\n",
        );
        let row = &reshape(&input).unwrap().rows[0];

        assert_eq!(row["Month_Year_Completion"], "May 2023");
        assert_eq!(row["Academic_Year"], "2023");
        assert_eq!(row["Academic_Month"], "5");
        assert_eq!(row["CREDIT_POINTS"], "32");
    }

    #[test]
    fn no_subject_columns_fails_fast() {
        let input = table("REGN_NO,CNAME\nAU21UG-001,Avery\n");
        let err = reshape(&input).unwrap_err();
        assert_eq!(err, ReshapeError::NoSubjectColumns);
    }

    #[test]
    fn missing_registration_column_is_reported() {
        let input = table("USN,SUB1,SUB1NM\nAU21UG-001,101,Maths\n");
        let err = reshape(&input).unwrap_err();
        assert_eq!(err, ReshapeError::MissingColumn("REGN_NO".into()));
    }

    #[test]
    fn registration_number_leads_identifiers() {
        let input = table("CNAME,REGN_NO,SUB1,SUB1NM\nAvery,AU21UG-001,101,Maths\n");
        let outcome = reshape(&input).unwrap();
        assert_eq!(outcome.report.identifiers, vec!["REGN_NO", "CNAME"]);
    }

    #[test]
    fn malformed_positions_are_skipped_not_fatal() {
        let input = table(
            "REGN_NO,SUB1,SUB1NM,SUB1A_TOT,SUB99999999999_TOT,SUB1_\nAU21UG-001,101,Maths,12,13,14\n",
        );
        let outcome = reshape(&input).unwrap();

        assert_eq!(outcome.rows.len(), 1);
        assert!(!outcome.rows[0].contains_key("Marks"));
        assert_eq!(
            outcome.report.malformed,
            vec!["SUB1A_TOT", "SUB99999999999_TOT", "SUB1_"]
        );
        assert_eq!(outcome.report.identifiers, vec!["REGN_NO"]);
    }

    #[test]
    fn one_position_written_two_ways_is_reported() {
        let input = table(
            "REGN_NO,SUB01,SUB01NM,SUB1,SUB1NM,SUB2,SUB2NM\n\
             AU21UG-001,101,Maths,102,Physics,103,Design\n",
        );
        let outcome = reshape(&input).unwrap();

        assert_eq!(outcome.report.malformed, vec!["SUB1", "SUB1NM"]);
        assert_eq!(outcome.report.positions, vec![1, 2]);
        let codes: Vec<&str> = outcome
            .rows
            .iter()
            .map(|row| row["SUBJECT_CODE"].as_str())
            .collect();
        assert_eq!(codes, vec!["101", "103"]);
        assert_eq!(outcome.rows[0]["SUBJECT_NAME"], "Maths");
    }

    #[test]
    fn identifier_sharing_a_stub_name_is_restored() {
        let input = table(
            "REGN_NO,GRADE,SUBJECT_NAME,SUB1,SUB1NM,SUB1_GRADE,SUB2,SUB2_GRADE\n\
             AU21UG-001,II,Core,101,Maths,A,102,B\n",
        );
        let outcome = reshape(&input).unwrap();

        assert_eq!(outcome.report.shadowed, vec!["GRADE_GLOBAL", "SUBJECT_NAME_GLOBAL"]);

        let first = &outcome.rows[0];
        assert_eq!(first["GRADE"], "II");
        assert_eq!(first["Grade"], "A");
        assert_eq!(first["SUBJECT_NAME"], "Maths");

        // Slot 2 has no name of its own, so the identifier value survives.
        let second = &outcome.rows[1];
        assert_eq!(second["SUBJECT_NAME"], "Core");
        assert_eq!(second["Grade"], "B");

        assert!(outcome.rows.iter().all(|row| !row.contains_key("GRADE_GLOBAL")));
        assert!(outcome.rows.iter().all(|row| !row.contains_key("SUBJECT_NAME_GLOBAL")));
    }

    #[test]
    fn pivoted_field_named_like_a_stub_identifier_keeps_both() {
        // TYPE is both an identifier column and a metric family.
        let input = table(
            "REGN_NO,TYPE,SUB1,SUB1_TYPE,SUB2\n\
             AU21UG-001,Regular,101,Core,102\n",
        );
        let outcome = reshape(&input).unwrap();

        assert_eq!(outcome.rows[0]["TYPE"], "Core");
        assert_eq!(outcome.rows[1]["TYPE"], "Regular");
    }

    #[test]
    fn subject_like_identifiers_pass_through() {
        let input = table("REGN_NO,SUBJECT_GROUP,SUB1,SUB1NM\nAU21UG-001,Science,101,Maths\n");
        let outcome = reshape(&input).unwrap();
        assert_eq!(outcome.rows[0]["SUBJECT_GROUP"], "Science");
    }

    #[test]
    fn row_count_matches_occupied_slots() {
        let slots = 5;
        let mut header = vec!["REGN_NO".to_string()];
        for n in 1..=slots {
            header.push(format!("SUB{n}"));
            header.push(format!("SUB{n}NM"));
        }

        let mut csv = header.join(",");
        csv.push('\n');
        let mut expected = 0;
        for student in 0..8usize {
            let mut cells = vec![format!("AU21UG-{student:03}")];
            for n in 1..=slots {
                if n <= student % slots + 1 {
                    cells.push(format!("{}", 100 + n));
                    cells.push(format!("Subject {n}"));
                    expected += 1;
                } else {
                    cells.push(String::new());
                    cells.push(String::new());
                }
            }
            csv.push_str(&cells.join(","));
            csv.push('\n');
        }

        let outcome = reshape(&table(&csv)).unwrap();
        assert_eq!(outcome.rows.len(), expected);
        assert_eq!(outcome.report.blank_slots, 8 * slots - expected);
    }
}
