use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A single numeric field exactly as the upstream source delivered it.
///
/// Upstream payloads are not trusted to carry clean numbers: a value can be a
/// JSON number, a numeric string or `null`. [`parse_price`] turns it into a
/// typed result before any arithmetic happens.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawField {
    Number(f64),
    Text(String),
    Null,
}

/// Parse a raw price field. Non-numeric, empty and non-finite values are
/// reported as missing instead of failing the row.
pub fn parse_price(field: &RawField) -> Option<f64> {
    let value = match field {
        RawField::Number(v) => *v,
        RawField::Text(s) => s.trim().parse::<f64>().ok()?,
        RawField::Null => return None,
    };
    value.is_finite().then_some(value)
}

/// One trading day as returned by a [`crate::source::PriceSource`].
#[derive(Debug, Clone)]
pub struct RawBar {
    pub date: NaiveDate,
    // OHLV are carried for completeness; only the close feeds indicators.
    #[allow(dead_code)]
    pub open: Option<f64>,
    #[allow(dead_code)]
    pub high: Option<f64>,
    #[allow(dead_code)]
    pub low: Option<f64>,
    pub close: RawField,
    #[allow(dead_code)]
    pub volume: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceRow {
    pub ticker: String,
    pub date: NaiveDate,
    pub close: Option<f64>,
}

impl PriceRow {
    pub fn from_raw(ticker: &str, bar: &RawBar) -> Self {
        Self {
            ticker: ticker.to_string(),
            date: bar.date,
            close: parse_price(&bar.close),
        }
    }
}

/// A price row with its derived indicator columns.
///
/// `None` means "no value": not enough history yet, or a missing close
/// somewhere in the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorRow {
    pub ticker: String,
    pub date: NaiveDate,
    pub close: Option<f64>,
    pub ma_5: Option<f64>,
    pub ma_20: Option<f64>,
    pub ma_50: Option<f64>,
    pub rsi: Option<f64>,
    pub daily_return: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedPoint {
    pub ticker: String,
    pub date: NaiveDate,
    pub close: Option<f64>,
    pub normalized: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_price_accepts_numbers_and_numeric_text() {
        assert_eq!(parse_price(&RawField::Number(12.5)), Some(12.5));
        assert_eq!(parse_price(&RawField::Text(" 7.25 ".into())), Some(7.25));
    }

    #[test]
    fn parse_price_marks_garbage_as_missing() {
        assert_eq!(parse_price(&RawField::Text("n/a".into())), None);
        assert_eq!(parse_price(&RawField::Text(String::new())), None);
        assert_eq!(parse_price(&RawField::Null), None);
        assert_eq!(parse_price(&RawField::Number(f64::NAN)), None);
        assert_eq!(parse_price(&RawField::Number(f64::INFINITY)), None);
    }

    #[test]
    fn raw_field_deserializes_mixed_json() {
        let fields: Vec<RawField> = serde_json::from_str(r#"[1.5, "2.5", null, "x"]"#).unwrap();
        assert_eq!(
            fields,
            vec![
                RawField::Number(1.5),
                RawField::Text("2.5".into()),
                RawField::Null,
                RawField::Text("x".into()),
            ]
        );
    }

    #[test]
    fn price_row_from_raw_parses_close() {
        let bar = RawBar {
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            open: None,
            high: None,
            low: None,
            close: RawField::Text("bad".into()),
            volume: None,
        };
        let row = PriceRow::from_raw("ABC", &bar);
        assert_eq!(row.ticker, "ABC");
        assert_eq!(row.close, None);
    }
}
