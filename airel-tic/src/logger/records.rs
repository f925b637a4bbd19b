//! Retrospect-compatible records files.
//!
//! Records are appended to daily files under a per-device directory. Each
//! records file starts with a YAML header in comment lines followed by a
//! tab-separated column header; raw electrometer samples go to a plain
//! CSV file next to it.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::DateTime;
use chrono_tz::Tz;
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

/// Record fields written to the records file, in column order.
pub const FIELDS: &[&str] = &[
    "is_settling",
    "begin_time_ms",
    "end_time_ms",
    "pos_concentration_mean",
    "neg_concentration_mean",
    "pos_concentration_stddev",
    "neg_concentration_stddev",
    "a_cev_voltage_raw_mean",
    "a_cev_voltage_raw_stddev",
    "a_cev_voltage_mean",
    "a_cev_voltage_stddev",
    "a_cev_voltage_target_mean",
    "a_cev_voltage_target_stddev",
    "a_cev_voltage_control_mean",
    "a_cev_voltage_control_stddev",
    "a_flow_rate_raw_mean",
    "a_flow_rate_raw_stddev",
    "a_flow_rate_mean",
    "a_flow_rate_stddev",
    "a_flow_rate_target_mean",
    "a_flow_rate_target_stddev",
    "a_flow_rate_control_mean",
    "a_flow_rate_control_stddev",
    "a_flow_rate_tacho_mean",
    "a_flow_rate_tacho_stddev",
    "b_cev_voltage_raw_mean",
    "b_cev_voltage_raw_stddev",
    "b_cev_voltage_mean",
    "b_cev_voltage_stddev",
    "b_cev_voltage_target_mean",
    "b_cev_voltage_target_stddev",
    "b_cev_voltage_control_mean",
    "b_cev_voltage_control_stddev",
    "b_flow_rate_raw_mean",
    "b_flow_rate_raw_stddev",
    "b_flow_rate_mean",
    "b_flow_rate_stddev",
    "b_flow_rate_target_mean",
    "b_flow_rate_target_stddev",
    "b_flow_rate_control_mean",
    "b_flow_rate_tacho_mean",
    "b_flow_rate_tacho_stddev",
    "b_flow_rate_control_stddev",
    "temperature_mean",
    "temperature_stddev",
    "humidity_mean",
    "humidity_stddev",
    "pressure_mean",
    "pressure_stddev",
    "env_sensor_sample_counter",
    "env_sensor_error_counter",
    "a_cev_adc_sample_counter",
    "a_cev_voltage_correction_counter",
    "b_cev_adc_sample_counter",
    "b_cev_voltage_correction_counter",
    "a_electrometer_sample_counter",
    "a_electrometer_reset_counter",
    "a_electrometer_error_counter",
    "b_electrometer_sample_counter",
    "b_electrometer_reset_counter",
    "b_electrometer_error_counter",
    "a_electrometer_current_mean",
    "a_electrometer_current_stddev",
    "a_electrometer_current_raw_mean",
    "a_electrometer_voltage",
    "b_electrometer_current_mean",
    "b_electrometer_current_raw_mean",
    "b_electrometer_current_stddev",
    "b_electrometer_voltage",
    "a_flow_sensor_error_counter",
    "a_flow_sensor_sample_counter",
    "b_flow_sensor_error_counter",
    "b_flow_sensor_sample_counter",
    "a_concentration_mean",
    "b_concentration_mean",
];

/// Counters whose transitions are reported in the log.
pub const MONITORED_COUNTERS: &[&str] = &[
    "env_sensor_error_counter",
    "a_flow_sensor_error_counter",
    "b_flow_sensor_error_counter",
    "a_electrometer_reset_counter",
    "b_electrometer_reset_counter",
    "a_electrometer_error_counter",
    "b_electrometer_error_counter",
];

/// Summary columns written ahead of the full field list.
const SUMMARY_FIELDS: &[&str] = &[
    "a_electrometer_current_mean",
    "b_electrometer_current_mean",
    "a_electrometer_current_stddev",
    "b_electrometer_current_stddev",
    "a_electrometer_current_raw_mean",
    "b_electrometer_current_raw_mean",
    "a_electrometer_voltage",
    "b_electrometer_voltage",
];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f%:z";

/// Append-mode file rotated by date.
pub struct TimedFile {
    directory: PathBuf,
    suffix: String,
    current: Option<(String, File)>,
}

impl TimedFile {
    /// Rotates through `directory/<YYYYMMDD><suffix>`, creating the
    /// directory on first use.
    pub fn new(directory: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            suffix: suffix.into(),
            current: None,
        }
    }

    /// File for the day of `t`; the flag is true when a file was freshly
    /// opened and needs a header.
    pub fn get(&mut self, t: &DateTime<Tz>) -> Result<(&mut File, bool)> {
        let file_name = format!("{}{}", t.format("%Y%m%d"), self.suffix);
        let fresh = self
            .current
            .as_ref()
            .map_or(true, |(name, _)| name != &file_name);

        if fresh {
            fs::create_dir_all(&self.directory)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.directory.join(&file_name))?;
            self.current = Some((file_name, file));
        }

        let (_, file) = self.current.as_mut().unwrap();
        Ok((file, fresh))
    }
}

/// Writers for one device's records and raw-electrometer files.
pub struct RecordsWriter {
    records: TimedFile,
    raw_em: TimedFile,
}

impl RecordsWriter {
    /// Files live under `<base>/<serial_number>/`.
    pub fn new(base: &Path, serial_number: &str) -> Self {
        let directory = base.join(serial_number);
        Self {
            records: TimedFile::new(&directory, "-block.records"),
            raw_em: TimedFile::new(&directory, ".rawem"),
        }
    }

    /// Append one record event; `now` is the local receive time.
    pub fn append_record(&mut self, record: &Map<String, Value>, now: &DateTime<Tz>) -> Result<()> {
        let (file, fresh) = self.records.get(now)?;
        if fresh {
            write_records_header(file)?;
        }

        let span_ms = field_f64(record, "end_time_ms") - field_f64(record, "begin_time_ms");
        let begin_time = *now - chrono::Duration::milliseconds(span_ms as i64);

        let mut row = vec![
            begin_time.format(TIMESTAMP_FORMAT).to_string(),
            now.format(TIMESTAMP_FORMAT).to_string(),
            value_str(record.get("opmode")),
        ];
        for name in SUMMARY_FIELDS {
            row.push(value_str(record.get(*name)));
        }
        for name in FIELDS {
            row.push(value_str(record.get(*name)));
        }
        row.push(String::new());

        writeln!(file, "{}", row.join("\t"))?;
        file.flush()?;
        Ok(())
    }

    /// Append one raw electrometer sample; incomplete samples are dropped.
    pub fn append_raw_em(&mut self, params: &Map<String, Value>, now: &DateTime<Tz>) -> Result<()> {
        let channel = params.get("channel").filter(|v| !v.is_null());
        let value = params
            .get("data")
            .and_then(|data| data.get("value"))
            .filter(|v| !v.is_null());
        let (Some(channel), Some(value)) = (channel, value) else {
            return Ok(());
        };

        let (file, fresh) = self.raw_em.get(now)?;
        if fresh {
            writeln!(file, "timestamp,mcutime,channel,value")?;
        }

        let timestamp = now.timestamp_micros() as f64 / 1e6;
        let mcutime = value_str(params.get("time"));
        writeln!(file, "{timestamp},{mcutime},{channel},{value}")?;
        Ok(())
    }
}

// Field rendering for the tab-separated rows: missing values become nan,
// booleans become 0/1 (is_settling).
fn value_str(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "nan".to_string(),
        Some(Value::Bool(flag)) => if *flag { "1" } else { "0" }.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn field_f64(record: &Map<String, Value>, name: &str) -> f64 {
    record.get(name).and_then(Value::as_f64).unwrap_or(0.0)
}

fn write_records_header(file: &mut File) -> Result<()> {
    let params: Vec<Value> = FIELDS
        .iter()
        .map(|name| json!({ "humanname": name, "name": name, "unit": "" }))
        .collect();

    let header = json!({
        "dataproc variant": "block",
        "electrometer groups": { "a_el": [0, 0], "b_el": [1, 1] },
        "electrometer names": ["A", "B"],
        "file type": "records",
        "instrument configuration": {},
        "opmodes": ["run", "zero", "run_swapped", "unknown"],
        "software": "tic_to_records",
        "total electrometers": 2,
        "parameters": params,
    });

    let yaml = serde_yaml::to_string(&header)
        .map_err(|e| Error::Encoding(format!("header serialization failed: {e}")))?;

    writeln!(file, "# Spectops records")?;
    for line in yaml.split('\n') {
        writeln!(file, "# {line}")?;
    }

    let mut columns = vec![
        "begin_time",
        "end_time",
        "opmode",
        "cur_0",
        "cur_1",
        "curvar_0",
        "curvar_1",
        "rawcur_0",
        "rawcur_1",
        "volt_0",
        "volt_1",
    ];
    columns.extend_from_slice(FIELDS);
    columns.push("flags");
    writeln!(file, "{}", columns.join("\t"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "airel-tic-records-{}-{name}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn local(tz: Tz, y: i32, mo: u32, d: u32, h: u32) -> DateTime<Tz> {
        tz.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn timed_file_rotates_daily() {
        let dir = temp_dir("rotate");
        let mut file = TimedFile::new(&dir, ".log");

        let (_, fresh) = file.get(&local(chrono_tz::UTC, 2026, 3, 1, 10)).unwrap();
        assert!(fresh);
        let (_, fresh) = file.get(&local(chrono_tz::UTC, 2026, 3, 1, 23)).unwrap();
        assert!(!fresh);
        let (_, fresh) = file.get(&local(chrono_tz::UTC, 2026, 3, 2, 0)).unwrap();
        assert!(fresh);

        assert!(dir.join("20260301.log").exists());
        assert!(dir.join("20260302.log").exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn value_rendering() {
        assert_eq!(value_str(None), "nan");
        assert_eq!(value_str(Some(&Value::Null)), "nan");
        assert_eq!(value_str(Some(&json!(true))), "1");
        assert_eq!(value_str(Some(&json!(false))), "0");
        assert_eq!(value_str(Some(&json!(2.5))), "2.5");
        assert_eq!(value_str(Some(&json!("run"))), "run");
    }

    #[test]
    fn records_file_gets_a_header_and_rows() {
        let dir = temp_dir("records");
        let mut writer = RecordsWriter::new(&dir, "0107E60A0101");

        let record = json!({
            "opmode": "run",
            "is_settling": false,
            "begin_time_ms": 1000,
            "end_time_ms": 6000,
            "a_electrometer_current_mean": 12.5,
            "b_electrometer_current_mean": -3.25,
        });
        let now = local(chrono_tz::Europe::Tallinn, 2026, 3, 1, 12);
        writer
            .append_record(record.as_object().unwrap(), &now)
            .unwrap();

        let path = dir.join("0107E60A0101").join("20260301-block.records");
        let contents = fs::read_to_string(path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next().unwrap(), "# Spectops records");
        assert!(contents.contains("# file type: records"));

        let columns: Vec<&str> = contents
            .lines()
            .find(|line| line.starts_with("begin_time\t"))
            .unwrap()
            .split('\t')
            .collect();
        assert_eq!(columns.len(), 11 + FIELDS.len() + 1);

        let row: Vec<&str> = contents.lines().last().unwrap().split('\t').collect();
        assert_eq!(row.len(), columns.len());
        assert_eq!(row[2], "run");
        // cur_0 carries the a-channel electrometer mean
        assert_eq!(row[3], "12.5");
        // missing fields render as nan, is_settling as 0
        assert_eq!(row[11], "0");
        assert_eq!(row[14], "nan");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn raw_em_rows_are_csv() {
        let dir = temp_dir("rawem");
        let mut writer = RecordsWriter::new(&dir, "dev");

        let now = local(chrono_tz::UTC, 2026, 3, 1, 12);
        let params = json!({ "channel": 1, "time": 123456, "data": { "value": 42 } });
        writer
            .append_raw_em(params.as_object().unwrap(), &now)
            .unwrap();

        // Samples without a value are dropped
        let empty = json!({ "channel": 1, "time": 123457 });
        writer
            .append_raw_em(empty.as_object().unwrap(), &now)
            .unwrap();

        let contents = fs::read_to_string(dir.join("dev").join("20260301.rawem")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "timestamp,mcutime,channel,value");
        assert!(lines[1].ends_with(",123456,1,42"));
        assert_eq!(lines.len(), 2);

        let _ = fs::remove_dir_all(&dir);
    }
}
