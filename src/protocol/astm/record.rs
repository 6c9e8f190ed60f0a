use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::constants::{
    COMPONENT_DELIMITER, FIELD_DELIMITER, HEADER_RECORD, MANUFACTURER_RECORD, ORDER_RECORD,
    PATIENT_RECORD, REPEAT_DELIMITER, REQUEST_RECORD, RESULT_RECORD, TERMINATOR_RECORD,
};

/// Represents a record type in the ASTM E1394 / LIS2-A layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    Header,
    Patient,
    Order,
    Result,
    Query,
    MResult,
    Terminator,
}

impl RecordType {
    /// Parse a record type from its one-character identifier
    /// (upper- or lower-case)
    pub fn from_identifier(id: &str) -> Option<Self> {
        match id.to_ascii_uppercase().as_str() {
            "H" => Some(RecordType::Header),
            "P" => Some(RecordType::Patient),
            "O" => Some(RecordType::Order),
            "R" => Some(RecordType::Result),
            "Q" => Some(RecordType::Query),
            "M" => Some(RecordType::MResult),
            "L" => Some(RecordType::Terminator),
            _ => None,
        }
    }

    /// Get the identifier for this record type
    pub fn to_identifier(&self) -> &'static str {
        match self {
            RecordType::Header => HEADER_RECORD,
            RecordType::Patient => PATIENT_RECORD,
            RecordType::Order => ORDER_RECORD,
            RecordType::Result => RESULT_RECORD,
            RecordType::Query => REQUEST_RECORD,
            RecordType::MResult => MANUFACTURER_RECORD,
            RecordType::Terminator => TERMINATOR_RECORD,
        }
    }
}

/// Split a composite field into components, padded with empty strings to the
/// requested component count
pub fn split_components(composite: &str, count: usize) -> Vec<String> {
    let mut components: Vec<String> = composite
        .split(COMPONENT_DELIMITER as char)
        .map(|s| s.to_string())
        .collect();
    while components.len() < count {
        components.push(String::new());
    }
    components
}

/// Join components into a composite string
pub fn join_components(components: &[String]) -> String {
    components.join(&(COMPONENT_DELIMITER as char).to_string())
}

/// Split a repeated field into its repeats
pub fn split_repeats(value: &str) -> Vec<String> {
    value
        .split(REPEAT_DELIMITER as char)
        .map(|s| s.to_string())
        .collect()
}

/// Parse a date/time string in ASTM format.
///
/// Accepts `YYYYMMDD`, `YYYYMMDDHHMM` and `YYYYMMDDHHMMSS`; missing time
/// components default to zero.
pub fn parse_datetime(dt_str: &str) -> Option<DateTime<Utc>> {
    if dt_str.len() < 8 || !dt_str.is_char_boundary(8) {
        return None;
    }

    let year = dt_str[0..4].parse::<i32>().ok()?;
    let month = dt_str[4..6].parse::<u32>().ok()?;
    let day = dt_str[6..8].parse::<u32>().ok()?;

    let mut hour = 0;
    let mut min = 0;
    let mut sec = 0;

    if dt_str.len() >= 10 {
        hour = dt_str[8..10].parse::<u32>().ok()?;
    }
    if dt_str.len() >= 12 {
        min = dt_str[10..12].parse::<u32>().ok()?;
    }
    if dt_str.len() >= 14 {
        sec = dt_str[12..14].parse::<u32>().ok()?;
    }

    let datetime = NaiveDateTime::new(
        chrono::NaiveDate::from_ymd_opt(year, month, day)?,
        chrono::NaiveTime::from_hms_opt(hour, min, sec)?,
    );

    Some(DateTime::<Utc>::from_naive_utc_and_offset(datetime, Utc))
}

/// Format a datetime to the full ASTM form (`YYYYMMDDHHMMSS`)
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y%m%d%H%M%S").to_string()
}

fn field(fields: &[&str], index: usize) -> String {
    fields.get(index).map(|s| s.to_string()).unwrap_or_default()
}

/// Join positional fields after the type character, trimming trailing empty
/// fields down to `min_fields`
fn encode_fields(type_id: &str, mut fields: Vec<String>, min_fields: usize) -> String {
    while fields.len() > min_fields && fields.last().map(|f| f.is_empty()).unwrap_or(false) {
        fields.pop();
    }

    let mut line = String::from(type_id);
    for value in &fields {
        line.push(FIELD_DELIMITER as char);
        line.push_str(value);
    }
    line
}

/// Message header record (`H`), ASTM E1394 positions 1..=13
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeaderRecord {
    pub delimiter_definition: String,
    pub message_control_id: String,
    pub access_password: String,
    pub sender_id: String,
    pub sender_address: String,
    pub reserved: String,
    pub sender_telephone: String,
    pub sender_characteristics: String,
    pub receiver_id: String,
    pub comment: String,
    pub processing_id: String,
    pub version_number: String,
    pub timestamp: String,
}

impl HeaderRecord {
    pub fn from_fields(fields: &[&str]) -> Self {
        Self {
            delimiter_definition: field(fields, 1),
            message_control_id: field(fields, 2),
            access_password: field(fields, 3),
            sender_id: field(fields, 4),
            sender_address: field(fields, 5),
            reserved: field(fields, 6),
            sender_telephone: field(fields, 7),
            sender_characteristics: field(fields, 8),
            receiver_id: field(fields, 9),
            comment: field(fields, 10),
            processing_id: field(fields, 11),
            version_number: field(fields, 12),
            timestamp: field(fields, 13),
        }
    }

    pub fn to_line(&self) -> String {
        // Field 1 is the delimiter definition; an empty one is emitted as
        // the standard set
        let mut line = String::from(HEADER_RECORD);
        line.push(FIELD_DELIMITER as char);
        line.push_str(if self.delimiter_definition.is_empty() {
            "\\^&"
        } else {
            &self.delimiter_definition
        });

        let rest = vec![
            self.message_control_id.clone(),
            self.access_password.clone(),
            self.sender_id.clone(),
            self.sender_address.clone(),
            self.reserved.clone(),
            self.sender_telephone.clone(),
            self.sender_characteristics.clone(),
            self.receiver_id.clone(),
            self.comment.clone(),
            self.processing_id.clone(),
            self.version_number.clone(),
            self.timestamp.clone(),
        ];
        let tail = encode_fields("", rest, 0);
        line.push_str(&tail);
        line
    }

    /// Sender identification components (`name^model^version^serial`)
    pub fn sender_components(&self) -> Vec<String> {
        split_components(&self.sender_id, 4)
    }

    pub fn message_time(&self) -> Option<DateTime<Utc>> {
        parse_datetime(&self.timestamp)
    }
}

/// Patient record (`P`), ASTM E1394 positions 1..=34
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PatientRecord {
    pub sequence_number: String,
    pub practice_patient_id: String,
    pub laboratory_patient_id: String,
    pub alternate_patient_id: String,
    pub patient_name: String,
    pub mothers_maiden_name: String,
    pub birth_date: String,
    pub sex: String,
    pub race: String,
    pub address: String,
    pub reserved: String,
    pub telephone: String,
    pub attending_physician: String,
    pub special_field_1: String,
    pub special_field_2: String,
    pub height: String,
    pub weight: String,
    pub diagnosis: String,
    pub medications: String,
    pub diet: String,
    pub practice_field_1: String,
    pub practice_field_2: String,
    pub admission_date: String,
    pub admission_status: String,
    pub location: String,
    pub nature_of_diagnostic: String,
    pub diagnostic_code: String,
    pub religion: String,
    pub marital_status: String,
    pub isolation_status: String,
    pub language: String,
    pub hospital_service: String,
    pub hospital_institution: String,
    pub dosage_category: String,
}

impl PatientRecord {
    pub fn from_fields(fields: &[&str]) -> Self {
        Self {
            sequence_number: field(fields, 1),
            practice_patient_id: field(fields, 2),
            laboratory_patient_id: field(fields, 3),
            alternate_patient_id: field(fields, 4),
            patient_name: field(fields, 5),
            mothers_maiden_name: field(fields, 6),
            birth_date: field(fields, 7),
            sex: field(fields, 8),
            race: field(fields, 9),
            address: field(fields, 10),
            reserved: field(fields, 11),
            telephone: field(fields, 12),
            attending_physician: field(fields, 13),
            special_field_1: field(fields, 14),
            special_field_2: field(fields, 15),
            height: field(fields, 16),
            weight: field(fields, 17),
            diagnosis: field(fields, 18),
            medications: field(fields, 19),
            diet: field(fields, 20),
            practice_field_1: field(fields, 21),
            practice_field_2: field(fields, 22),
            admission_date: field(fields, 23),
            admission_status: field(fields, 24),
            location: field(fields, 25),
            nature_of_diagnostic: field(fields, 26),
            diagnostic_code: field(fields, 27),
            religion: field(fields, 28),
            marital_status: field(fields, 29),
            isolation_status: field(fields, 30),
            language: field(fields, 31),
            hospital_service: field(fields, 32),
            hospital_institution: field(fields, 33),
            dosage_category: field(fields, 34),
        }
    }

    pub fn to_line(&self) -> String {
        encode_fields(
            PATIENT_RECORD,
            vec![
                self.sequence_number.clone(),
                self.practice_patient_id.clone(),
                self.laboratory_patient_id.clone(),
                self.alternate_patient_id.clone(),
                self.patient_name.clone(),
                self.mothers_maiden_name.clone(),
                self.birth_date.clone(),
                self.sex.clone(),
                self.race.clone(),
                self.address.clone(),
                self.reserved.clone(),
                self.telephone.clone(),
                self.attending_physician.clone(),
                self.special_field_1.clone(),
                self.special_field_2.clone(),
                self.height.clone(),
                self.weight.clone(),
                self.diagnosis.clone(),
                self.medications.clone(),
                self.diet.clone(),
                self.practice_field_1.clone(),
                self.practice_field_2.clone(),
                self.admission_date.clone(),
                self.admission_status.clone(),
                self.location.clone(),
                self.nature_of_diagnostic.clone(),
                self.diagnostic_code.clone(),
                self.religion.clone(),
                self.marital_status.clone(),
                self.isolation_status.clone(),
                self.language.clone(),
                self.hospital_service.clone(),
                self.hospital_institution.clone(),
                self.dosage_category.clone(),
            ],
            1,
        )
    }

    /// Name components (`Last^First^Middle^Suffix^Title`), padded to five
    pub fn name_components(&self) -> Vec<String> {
        split_components(&self.patient_name, 5)
    }

    pub fn birth_datetime(&self) -> Option<DateTime<Utc>> {
        parse_datetime(&self.birth_date)
    }
}

/// Test order record (`O`), ASTM E1394 positions 1..=30
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderRecord {
    pub sequence_number: String,
    pub specimen_id: String,
    pub instrument_specimen_id: String,
    pub universal_test_id: String,
    pub priority: String,
    pub requested_date_time: String,
    pub collection_date_time: String,
    pub collection_end_time: String,
    pub collection_volume: String,
    pub collector_id: String,
    pub action_code: String,
    pub danger_code: String,
    pub relevant_clinical_info: String,
    pub received_date_time: String,
    pub specimen_descriptor: String,
    pub ordering_physician: String,
    pub physician_telephone: String,
    pub user_field_1: String,
    pub user_field_2: String,
    pub laboratory_field_1: String,
    pub laboratory_field_2: String,
    pub report_date_time: String,
    pub instrument_charge: String,
    pub instrument_section_id: String,
    pub report_type: String,
    pub reserved: String,
    pub collection_location: String,
    pub nosocomial_infection_flag: String,
    pub specimen_service: String,
    pub specimen_institution: String,
}

impl OrderRecord {
    pub fn from_fields(fields: &[&str]) -> Self {
        Self {
            sequence_number: field(fields, 1),
            specimen_id: field(fields, 2),
            instrument_specimen_id: field(fields, 3),
            universal_test_id: field(fields, 4),
            priority: field(fields, 5),
            requested_date_time: field(fields, 6),
            collection_date_time: field(fields, 7),
            collection_end_time: field(fields, 8),
            collection_volume: field(fields, 9),
            collector_id: field(fields, 10),
            action_code: field(fields, 11),
            danger_code: field(fields, 12),
            relevant_clinical_info: field(fields, 13),
            received_date_time: field(fields, 14),
            specimen_descriptor: field(fields, 15),
            ordering_physician: field(fields, 16),
            physician_telephone: field(fields, 17),
            user_field_1: field(fields, 18),
            user_field_2: field(fields, 19),
            laboratory_field_1: field(fields, 20),
            laboratory_field_2: field(fields, 21),
            report_date_time: field(fields, 22),
            instrument_charge: field(fields, 23),
            instrument_section_id: field(fields, 24),
            report_type: field(fields, 25),
            reserved: field(fields, 26),
            collection_location: field(fields, 27),
            nosocomial_infection_flag: field(fields, 28),
            specimen_service: field(fields, 29),
            specimen_institution: field(fields, 30),
        }
    }

    pub fn to_line(&self) -> String {
        encode_fields(
            ORDER_RECORD,
            vec![
                self.sequence_number.clone(),
                self.specimen_id.clone(),
                self.instrument_specimen_id.clone(),
                self.universal_test_id.clone(),
                self.priority.clone(),
                self.requested_date_time.clone(),
                self.collection_date_time.clone(),
                self.collection_end_time.clone(),
                self.collection_volume.clone(),
                self.collector_id.clone(),
                self.action_code.clone(),
                self.danger_code.clone(),
                self.relevant_clinical_info.clone(),
                self.received_date_time.clone(),
                self.specimen_descriptor.clone(),
                self.ordering_physician.clone(),
                self.physician_telephone.clone(),
                self.user_field_1.clone(),
                self.user_field_2.clone(),
                self.laboratory_field_1.clone(),
                self.laboratory_field_2.clone(),
                self.report_date_time.clone(),
                self.instrument_charge.clone(),
                self.instrument_section_id.clone(),
                self.report_type.clone(),
                self.reserved.clone(),
                self.collection_location.clone(),
                self.nosocomial_infection_flag.clone(),
                self.specimen_service.clone(),
                self.specimen_institution.clone(),
            ],
            1,
        )
    }

    /// Universal test id components (`code^name^type^qualifier`), padded to
    /// four
    pub fn test_id_components(&self) -> Vec<String> {
        split_components(&self.universal_test_id, 4)
    }

    /// Individual tests when the order carries a repeated test id field
    pub fn requested_tests(&self) -> Vec<String> {
        split_repeats(&self.universal_test_id)
    }

    pub fn requested_datetime(&self) -> Option<DateTime<Utc>> {
        parse_datetime(&self.requested_date_time)
    }
}

/// Result record (`R`), ASTM E1394 positions 1..=13
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResultRecord {
    pub sequence_number: String,
    pub universal_test_id: String,
    pub value: String,
    pub units: String,
    pub reference_range: String,
    pub abnormal_flags: String,
    pub nature_of_abnormality: String,
    pub result_status: String,
    pub normatives_change_date: String,
    pub operator_id: String,
    pub started_date_time: String,
    pub completed_date_time: String,
    pub instrument_id: String,
}

impl ResultRecord {
    pub fn from_fields(fields: &[&str]) -> Self {
        Self {
            sequence_number: field(fields, 1),
            universal_test_id: field(fields, 2),
            value: field(fields, 3),
            units: field(fields, 4),
            reference_range: field(fields, 5),
            abnormal_flags: field(fields, 6),
            nature_of_abnormality: field(fields, 7),
            result_status: field(fields, 8),
            normatives_change_date: field(fields, 9),
            operator_id: field(fields, 10),
            started_date_time: field(fields, 11),
            completed_date_time: field(fields, 12),
            instrument_id: field(fields, 13),
        }
    }

    pub fn to_line(&self) -> String {
        encode_fields(
            RESULT_RECORD,
            vec![
                self.sequence_number.clone(),
                self.universal_test_id.clone(),
                self.value.clone(),
                self.units.clone(),
                self.reference_range.clone(),
                self.abnormal_flags.clone(),
                self.nature_of_abnormality.clone(),
                self.result_status.clone(),
                self.normatives_change_date.clone(),
                self.operator_id.clone(),
                self.started_date_time.clone(),
                self.completed_date_time.clone(),
                self.instrument_id.clone(),
            ],
            1,
        )
    }

    pub fn test_id_components(&self) -> Vec<String> {
        split_components(&self.universal_test_id, 4)
    }

    pub fn completed_datetime(&self) -> Option<DateTime<Utc>> {
        parse_datetime(&self.completed_date_time)
    }
}

/// Request information (query) record (`Q`), ASTM E1394 positions 1..=12
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryRecord {
    pub sequence_number: String,
    pub starting_range_id: String,
    pub ending_range_id: String,
    pub universal_test_id: String,
    pub request_time_limits: String,
    pub beginning_results_date_time: String,
    pub ending_results_date_time: String,
    pub requesting_physician: String,
    pub requesting_physician_telephone: String,
    pub user_field_1: String,
    pub user_field_2: String,
    pub request_status_code: String,
}

impl QueryRecord {
    pub fn from_fields(fields: &[&str]) -> Self {
        Self {
            sequence_number: field(fields, 1),
            starting_range_id: field(fields, 2),
            ending_range_id: field(fields, 3),
            universal_test_id: field(fields, 4),
            request_time_limits: field(fields, 5),
            beginning_results_date_time: field(fields, 6),
            ending_results_date_time: field(fields, 7),
            requesting_physician: field(fields, 8),
            requesting_physician_telephone: field(fields, 9),
            user_field_1: field(fields, 10),
            user_field_2: field(fields, 11),
            request_status_code: field(fields, 12),
        }
    }

    pub fn to_line(&self) -> String {
        encode_fields(
            REQUEST_RECORD,
            vec![
                self.sequence_number.clone(),
                self.starting_range_id.clone(),
                self.ending_range_id.clone(),
                self.universal_test_id.clone(),
                self.request_time_limits.clone(),
                self.beginning_results_date_time.clone(),
                self.ending_results_date_time.clone(),
                self.requesting_physician.clone(),
                self.requesting_physician_telephone.clone(),
                self.user_field_1.clone(),
                self.user_field_2.clone(),
                self.request_status_code.clone(),
            ],
            1,
        )
    }

    /// Specimen id components of the starting range (`patientId^specimenId`)
    pub fn starting_range_components(&self) -> Vec<String> {
        split_components(&self.starting_range_id, 2)
    }
}

/// Manufacturer result record (`M`). The field layout past the sequence
/// number is vendor-defined, so the tail is kept positionally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MResultRecord {
    pub sequence_number: String,
    pub fields: Vec<String>,
}

impl MResultRecord {
    pub fn from_fields(fields: &[&str]) -> Self {
        Self {
            sequence_number: field(fields, 1),
            fields: fields.iter().skip(2).map(|s| s.to_string()).collect(),
        }
    }

    pub fn to_line(&self) -> String {
        let mut all = vec![self.sequence_number.clone()];
        all.extend(self.fields.iter().cloned());
        encode_fields(MANUFACTURER_RECORD, all, 1)
    }

    pub fn get_field(&self, index: usize) -> Option<&str> {
        // Positional per the wire: index 1 is the sequence number
        match index {
            0 => None,
            1 => Some(self.sequence_number.as_str()),
            n => self.fields.get(n - 2).map(|s| s.as_str()),
        }
    }
}

/// Message terminator record (`L`), positions 1..=2
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TerminatorRecord {
    pub sequence_number: String,
    pub termination_code: String,
}

impl TerminatorRecord {
    pub fn from_fields(fields: &[&str]) -> Self {
        Self {
            sequence_number: field(fields, 1),
            termination_code: field(fields, 2),
        }
    }

    pub fn to_line(&self) -> String {
        // Terminators keep both positions even when empty; analyzers send
        // the bare `L||` form in keep-alives.
        encode_fields(
            TERMINATOR_RECORD,
            vec![
                self.sequence_number.clone(),
                self.termination_code.clone(),
            ],
            2,
        )
    }
}

/// A parsed ASTM record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "recordType", rename_all = "camelCase")]
pub enum Record {
    Header(HeaderRecord),
    Patient(PatientRecord),
    Order(OrderRecord),
    Result(ResultRecord),
    Query(QueryRecord),
    MResult(MResultRecord),
    Terminator(TerminatorRecord),
}

impl Record {
    /// Parse one record line. Returns `None` for record types outside the
    /// H/P/O/R/Q/M/L set; the caller decides whether to warn.
    pub fn parse_line(line: &str) -> Option<Self> {
        if line.is_empty() {
            return None;
        }

        let fields: Vec<&str> = line.split(FIELD_DELIMITER as char).collect();
        let record_type = RecordType::from_identifier(fields[0])?;

        Some(match record_type {
            RecordType::Header => Record::Header(HeaderRecord::from_fields(&fields)),
            RecordType::Patient => Record::Patient(PatientRecord::from_fields(&fields)),
            RecordType::Order => Record::Order(OrderRecord::from_fields(&fields)),
            RecordType::Result => Record::Result(ResultRecord::from_fields(&fields)),
            RecordType::Query => Record::Query(QueryRecord::from_fields(&fields)),
            RecordType::MResult => Record::MResult(MResultRecord::from_fields(&fields)),
            RecordType::Terminator => Record::Terminator(TerminatorRecord::from_fields(&fields)),
        })
    }

    /// Encode the record back to its wire line
    pub fn to_line(&self) -> String {
        match self {
            Record::Header(r) => r.to_line(),
            Record::Patient(r) => r.to_line(),
            Record::Order(r) => r.to_line(),
            Record::Result(r) => r.to_line(),
            Record::Query(r) => r.to_line(),
            Record::MResult(r) => r.to_line(),
            Record::Terminator(r) => r.to_line(),
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            Record::Header(_) => RecordType::Header,
            Record::Patient(_) => RecordType::Patient,
            Record::Order(_) => RecordType::Order,
            Record::Result(_) => RecordType::Result,
            Record::Query(_) => RecordType::Query,
            Record::MResult(_) => RecordType::MResult,
            Record::Terminator(_) => RecordType::Terminator,
        }
    }

    /// The record sequence number field, where present
    pub fn sequence_number(&self) -> Option<&str> {
        match self {
            Record::Header(_) => None,
            Record::Patient(r) => Some(r.sequence_number.as_str()),
            Record::Order(r) => Some(r.sequence_number.as_str()),
            Record::Result(r) => Some(r.sequence_number.as_str()),
            Record::Query(r) => Some(r.sequence_number.as_str()),
            Record::MResult(r) => Some(r.sequence_number.as_str()),
            Record::Terminator(r) => Some(r.sequence_number.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_identifiers() {
        assert_eq!(RecordType::from_identifier("H"), Some(RecordType::Header));
        assert_eq!(RecordType::from_identifier("q"), Some(RecordType::Query));
        assert_eq!(RecordType::from_identifier("M"), Some(RecordType::MResult));
        assert_eq!(RecordType::from_identifier("X"), None);
        assert_eq!(RecordType::Result.to_identifier(), "R");
    }

    #[test]
    fn test_parse_header_record() {
        let line = "H|\\^&|||OCD^VISION^5.13.1^J1|||||||P|LIS2-A|20250101120000";
        let record = Record::parse_line(line).unwrap();
        let header = match record {
            Record::Header(h) => h,
            other => panic!("expected header, got {:?}", other),
        };

        assert_eq!(header.delimiter_definition, "\\^&");
        assert_eq!(header.sender_id, "OCD^VISION^5.13.1^J1");
        assert_eq!(header.processing_id, "P");
        assert_eq!(header.version_number, "LIS2-A");
        assert_eq!(header.timestamp, "20250101120000");
        assert_eq!(
            header.sender_components(),
            vec!["OCD", "VISION", "5.13.1", "J1"]
        );
    }

    #[test]
    fn test_header_roundtrip() {
        let line = "H|\\^&|||OCD^VISION^5.13.1^J1|||||||P|LIS2-A|20250101120000";
        let record = Record::parse_line(line).unwrap();
        assert_eq!(record.to_line(), line);
    }

    #[test]
    fn test_parse_patient_record_name_components() {
        let line = "P|1|PID1||||Doe^John||19800101|M";
        let patient = match Record::parse_line(line).unwrap() {
            Record::Patient(p) => p,
            other => panic!("expected patient, got {:?}", other),
        };

        assert_eq!(patient.practice_patient_id, "PID1");
        assert_eq!(patient.sex, "M");
        // Padded to the canonical five components
        assert_eq!(
            patient.name_components(),
            vec!["Doe", "John", "", "", ""]
        );
        assert_eq!(
            patient.birth_datetime().unwrap(),
            parse_datetime("19800101").unwrap()
        );
    }

    #[test]
    fn test_parse_order_record() {
        let line = "O|1|S1||ABO|N|20250101120000|||||||||CENT|||||||20250101120000|||F";
        let order = match Record::parse_line(line).unwrap() {
            Record::Order(o) => o,
            other => panic!("expected order, got {:?}", other),
        };

        assert_eq!(order.sequence_number, "1");
        assert_eq!(order.specimen_id, "S1");
        assert_eq!(order.universal_test_id, "ABO");
        assert_eq!(order.priority, "N");
        assert_eq!(order.specimen_descriptor, "CENT");
        assert_eq!(order.report_date_time, "20250101120000");
        assert_eq!(order.report_type, "F");
    }

    #[test]
    fn test_order_roundtrip() {
        let line = "O|1|S1||ABO|N|20250101120000|||||||||CENT|||||||20250101120000|||F";
        let record = Record::parse_line(line).unwrap();
        assert_eq!(record.to_line(), line);
    }

    #[test]
    fn test_parse_result_record() {
        let line = "R|1|ABO|A|||||F||Auto||20250101120000|J1";
        let result = match Record::parse_line(line).unwrap() {
            Record::Result(r) => r,
            other => panic!("expected result, got {:?}", other),
        };

        assert_eq!(result.universal_test_id, "ABO");
        assert_eq!(result.value, "A");
        assert_eq!(result.result_status, "F");
        assert_eq!(result.operator_id, "Auto");
        assert_eq!(result.completed_date_time, "20250101120000");
        assert_eq!(result.instrument_id, "J1");
    }

    #[test]
    fn test_parse_query_record() {
        let line = "Q|1|^S42||||||||||O";
        let query = match Record::parse_line(line).unwrap() {
            Record::Query(q) => q,
            other => panic!("expected query, got {:?}", other),
        };

        assert_eq!(query.starting_range_id, "^S42");
        assert_eq!(query.request_status_code, "O");
        assert_eq!(query.starting_range_components(), vec!["", "S42"]);
    }

    #[test]
    fn test_mresult_keeps_vendor_tail() {
        let line = "M|1|WELL|A1|4+";
        let mresult = match Record::parse_line(line).unwrap() {
            Record::MResult(m) => m,
            other => panic!("expected mresult, got {:?}", other),
        };

        assert_eq!(mresult.sequence_number, "1");
        assert_eq!(mresult.fields, vec!["WELL", "A1", "4+"]);
        assert_eq!(mresult.get_field(2), Some("WELL"));
        assert_eq!(mresult.to_line(), line);
    }

    #[test]
    fn test_terminator_keeps_empty_positions() {
        let record = Record::parse_line("L||").unwrap();
        assert_eq!(record.to_line(), "L||");

        let normal = Record::parse_line("L|1|N").unwrap();
        assert_eq!(normal.to_line(), "L|1|N");
    }

    #[test]
    fn test_unknown_record_type_is_none() {
        assert!(Record::parse_line("C|1|comment").is_none());
        assert!(Record::parse_line("Z|1|x").is_none());
        assert!(Record::parse_line("").is_none());
    }

    #[test]
    fn test_parse_datetime_precision() {
        let full = parse_datetime("20220902174004").unwrap();
        assert_eq!(format_datetime(&full), "20220902174004");

        let date_only = parse_datetime("20220902").unwrap();
        assert_eq!(format_datetime(&date_only), "20220902000000");

        let minutes = parse_datetime("202209021740").unwrap();
        assert_eq!(format_datetime(&minutes), "20220902174000");

        assert!(parse_datetime("2022").is_none());
        assert!(parse_datetime("20221390").is_none());
    }

    #[test]
    fn test_component_padding() {
        assert_eq!(split_components("A^B", 4), vec!["A", "B", "", ""]);
        assert_eq!(
            join_components(&["A".to_string(), "B".to_string()]),
            "A^B"
        );
        assert_eq!(split_repeats("ABO\\RH"), vec!["ABO", "RH"]);
    }
}
