use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::protocol::error::{ProtocolError, Result};

use super::constants::CR;
use super::record::{
    format_datetime, HeaderRecord, MResultRecord, OrderRecord, PatientRecord, QueryRecord, Record,
    ResultRecord, TerminatorRecord,
};

/// Classification of a complete ASTM message, used for routing and
/// keep-alive suppression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    KeepAlive,
    Result,
    Query,
    Order,
    Message,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::KeepAlive => "KEEP_ALIVE",
            MessageType::Result => "RESULT",
            MessageType::Query => "QUERY",
            MessageType::Order => "ORDER",
            MessageType::Message => "MESSAGE",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "KEEP_ALIVE" => Ok(MessageType::KeepAlive),
            "RESULT" => Ok(MessageType::Result),
            "QUERY" => Ok(MessageType::Query),
            "ORDER" => Ok(MessageType::Order),
            "MESSAGE" => Ok(MessageType::Message),
            other => Err(ProtocolError::InvalidRecordFormat(format!(
                "Unknown message type: {}",
                other
            ))),
        }
    }
}

/// A result record together with the manufacturer records that follow it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResultEntry {
    #[serde(flatten)]
    pub record: ResultRecord,
    pub manufacturer_results: Vec<MResultRecord>,
}

impl ResultEntry {
    pub fn new(record: ResultRecord) -> Self {
        Self {
            record,
            manufacturer_results: Vec::new(),
        }
    }
}

/// Aggregate of one complete ASTM transmission.
///
/// Manufacturer (`M`) records are attached to the most recently preceding
/// result; records seen before any result land in the message-level list.
/// The originally received wire form (framing stripped, records joined by
/// CR) is retained in `raw_bytes` for audit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AstmMessage {
    pub instrument_name: String,
    pub message_type: Option<MessageType>,
    pub header: Option<HeaderRecord>,
    pub patient: Option<PatientRecord>,
    pub order_records: Vec<OrderRecord>,
    pub result_records: Vec<ResultEntry>,
    pub query_records: Vec<QueryRecord>,
    pub manufacturer_records: Vec<MResultRecord>,
    pub terminator: Option<TerminatorRecord>,
    #[serde(skip)]
    pub raw_bytes: Vec<u8>,
    #[serde(skip)]
    pub parse_warnings: Vec<String>,
}

impl AstmMessage {
    /// Parse the content of a complete transmission (records joined by CR)
    pub fn parse(content: &[u8], instrument_name: &str) -> Result<Self> {
        let text = std::str::from_utf8(content).map_err(|_| {
            ProtocolError::InvalidRecordFormat("Transmission is not valid UTF-8".to_string())
        })?;

        let mut message = AstmMessage {
            instrument_name: instrument_name.to_string(),
            raw_bytes: content.to_vec(),
            ..Default::default()
        };

        let mut header_count = 0usize;
        let mut terminator_count = 0usize;
        let mut recognized = 0usize;
        let mut last_seq_per_type: std::collections::HashMap<&'static str, u32> =
            std::collections::HashMap::new();

        for line in text.split(CR as char) {
            let line = line.trim_end_matches(super::constants::LF as char);
            if line.is_empty() {
                continue;
            }

            let record = match Record::parse_line(line) {
                Some(record) => record,
                None => {
                    let prefix: String = line.chars().take(16).collect();
                    warn!(
                        "[{}] Ignoring record with unknown type: {:?}",
                        instrument_name, prefix
                    );
                    message.parse_warnings.push(format!(
                        "Ignored record with unknown type: {:?}",
                        line.chars().next().unwrap_or('?')
                    ));
                    continue;
                }
            };

            recognized += 1;
            message.note_sequence(&record, &mut last_seq_per_type);

            match record {
                Record::Header(header) => {
                    header_count += 1;
                    if message.header.is_none() {
                        message.header = Some(header);
                    } else {
                        message
                            .parse_warnings
                            .push("Duplicate header record ignored".to_string());
                    }
                }
                Record::Patient(patient) => {
                    if message.patient.is_none() {
                        message.patient = Some(patient);
                    } else {
                        message
                            .parse_warnings
                            .push("Additional patient record ignored".to_string());
                    }
                }
                Record::Order(order) => message.order_records.push(order),
                Record::Result(result) => {
                    message.result_records.push(ResultEntry::new(result))
                }
                Record::Query(query) => message.query_records.push(query),
                Record::MResult(mresult) => match message.result_records.last_mut() {
                    Some(entry) => entry.manufacturer_results.push(mresult),
                    None => message.manufacturer_records.push(mresult),
                },
                Record::Terminator(terminator) => {
                    terminator_count += 1;
                    if message.terminator.is_none() {
                        message.terminator = Some(terminator);
                    }
                }
            }
        }

        if recognized == 0 {
            return Err(ProtocolError::InvalidRecordFormat(
                "Transmission contains no recognizable records".to_string(),
            ));
        }

        if message.header.is_none() && message.has_data_records() {
            message
                .parse_warnings
                .push("Data records present without a header record".to_string());
        }

        message.message_type = Some(message.classify(header_count, terminator_count));

        Ok(message)
    }

    fn has_data_records(&self) -> bool {
        self.patient.is_some()
            || !self.order_records.is_empty()
            || !self.result_records.is_empty()
            || !self.query_records.is_empty()
            || !self.manufacturer_records.is_empty()
    }

    /// Record skipped or restarted sequence numbers as parse warnings;
    /// monotonicity is never required.
    fn note_sequence(
        &mut self,
        record: &Record,
        last_seq: &mut std::collections::HashMap<&'static str, u32>,
    ) {
        let type_id = record.record_type().to_identifier();
        let Some(seq) = record.sequence_number() else {
            return;
        };
        let Ok(seq) = seq.parse::<u32>() else {
            return;
        };

        if let Some(&previous) = last_seq.get(type_id) {
            if seq <= previous {
                self.parse_warnings.push(format!(
                    "{} record sequence restarted at {} after {}",
                    type_id, seq, previous
                ));
            } else if seq > previous + 1 {
                self.parse_warnings.push(format!(
                    "{} record sequence skipped from {} to {}",
                    type_id, previous, seq
                ));
            }
        }
        last_seq.insert(type_id, seq);
    }

    fn classify(&self, header_count: usize, terminator_count: usize) -> MessageType {
        let data_free = !self.has_data_records();
        if header_count == 1 && terminator_count == 1 && data_free {
            return MessageType::KeepAlive;
        }
        if !self.result_records.is_empty() {
            return MessageType::Result;
        }
        if !self.query_records.is_empty() {
            return MessageType::Query;
        }
        if !self.order_records.is_empty() {
            return MessageType::Order;
        }
        MessageType::Message
    }

    /// The classification computed at parse time, defaulting to MESSAGE
    pub fn message_type(&self) -> MessageType {
        self.message_type.unwrap_or(MessageType::Message)
    }

    /// Flatten the aggregate back into wire order: header, patient, orders,
    /// unowned manufacturer records, results each followed by their
    /// manufacturer records, queries, terminator.
    pub fn to_records(&self) -> Vec<Record> {
        let mut records = Vec::new();

        if let Some(header) = &self.header {
            records.push(Record::Header(header.clone()));
        }
        if let Some(patient) = &self.patient {
            records.push(Record::Patient(patient.clone()));
        }
        for order in &self.order_records {
            records.push(Record::Order(order.clone()));
        }
        for mresult in &self.manufacturer_records {
            records.push(Record::MResult(mresult.clone()));
        }
        for entry in &self.result_records {
            records.push(Record::Result(entry.record.clone()));
            for mresult in &entry.manufacturer_results {
                records.push(Record::MResult(mresult.clone()));
            }
        }
        for query in &self.query_records {
            records.push(Record::Query(query.clone()));
        }
        if let Some(terminator) = &self.terminator {
            records.push(Record::Terminator(terminator.clone()));
        }

        records
    }

    /// Serialize to the transmission content form (records joined by CR)
    pub fn serialize(&self) -> Vec<u8> {
        let mut content = Vec::new();
        for record in self.to_records() {
            content.extend_from_slice(record.to_line().as_bytes());
            content.push(CR);
        }
        content
    }

    /// Renumber record sequence fields for emission: 1..n within each record
    /// class, manufacturer records restarting per owning result
    pub fn renumber_for_send(&mut self) {
        if let Some(patient) = &mut self.patient {
            patient.sequence_number = "1".to_string();
        }
        for (i, order) in self.order_records.iter_mut().enumerate() {
            order.sequence_number = (i + 1).to_string();
        }
        for (i, query) in self.query_records.iter_mut().enumerate() {
            query.sequence_number = (i + 1).to_string();
        }
        for (i, entry) in self.result_records.iter_mut().enumerate() {
            entry.record.sequence_number = (i + 1).to_string();
            for (j, mresult) in entry.manufacturer_results.iter_mut().enumerate() {
                mresult.sequence_number = (j + 1).to_string();
            }
        }
        for (i, mresult) in self.manufacturer_records.iter_mut().enumerate() {
            mresult.sequence_number = (i + 1).to_string();
        }
    }

    /// Build the minimal keep-alive message: a header stamped with the
    /// current time and a bare terminator
    pub fn keep_alive(instrument_name: &str, sender_id: &str, now: DateTime<Utc>) -> Self {
        AstmMessage {
            instrument_name: instrument_name.to_string(),
            message_type: Some(MessageType::KeepAlive),
            header: Some(HeaderRecord {
                delimiter_definition: "\\^&".to_string(),
                sender_id: sender_id.to_string(),
                processing_id: "P".to_string(),
                version_number: "LIS2-A".to_string(),
                timestamp: format_datetime(&now),
                ..Default::default()
            }),
            terminator: Some(TerminatorRecord::default()),
            ..Default::default()
        }
    }

    /// Total number of result records
    pub fn result_count(&self) -> usize {
        self.result_records.len()
    }

    /// Total number of order records
    pub fn order_count(&self) -> usize {
        self.order_records.len()
    }
}

/// Classify a transmission from the leading characters of its record lines,
/// without a full parse. Used for the audit row written before parsing.
pub fn quick_classify(content: &[u8]) -> MessageType {
    let mut headers = 0usize;
    let mut terminators = 0usize;
    let mut results = 0usize;
    let mut queries = 0usize;
    let mut orders = 0usize;
    let mut other_data = 0usize;

    for line in content.split(|&b| b == CR) {
        let Some(&first) = line.first() else {
            continue;
        };
        match first.to_ascii_uppercase() {
            b'H' => headers += 1,
            b'L' => terminators += 1,
            b'R' => results += 1,
            b'Q' => queries += 1,
            b'O' => orders += 1,
            b'P' | b'M' => other_data += 1,
            _ => {}
        }
    }

    if headers == 1
        && terminators == 1
        && results + queries + orders + other_data == 0
    {
        MessageType::KeepAlive
    } else if results > 0 {
        MessageType::Result
    } else if queries > 0 {
        MessageType::Query
    } else if orders > 0 {
        MessageType::Order
    } else {
        MessageType::Message
    }
}
