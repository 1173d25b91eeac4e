use crate::telemetry::{FieldMap, Readings, TechnologyRecord, TechnologyTag};
use crate::transport::RawLine;
use regex::Regex;
use thiserror::Error;
use tracing::{error, trace, warn};

pub const SERVING_CELL_COMMAND: &str = "AT+QENG=\"servingcell\"";
pub const REPLY_PREFIX: &str = "+QENG: ";
pub const LTE_MARKER: &str = "LTE";
pub const NR_NSA_MARKER: &str = "NR5G-NSA";
pub const NO_SERVICE_SENTINEL: &str = "+QENG: \"servingcell\",\"NOCONN\"";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unrecognized {tag} line: {line:?}")]
    Unrecognized { tag: TechnologyTag, line: String },
    #[error("logic error: line matches both {first} and {second}: {line:?}")]
    Ambiguous {
        first: &'static str,
        second: &'static str,
        line: String,
    },
    #[error("connection type unknown: {0:?}")]
    UnknownConnectionType(String),
}

/// One comma-separated element of a reply line.
#[derive(Debug, Clone, Copy)]
pub enum Element {
    /// Fixed text that must appear verbatim.
    Literal(&'static str),
    /// Unquoted value captured under the given field name.
    Bare(&'static str),
    /// Double-quoted value captured without its quotes.
    Quoted(&'static str),
}

impl Element {
    fn pattern(self) -> String {
        match self {
            Element::Literal(text) => regex::escape(text),
            Element::Bare(name) => format!("(?P<{name}>[^,]*)"),
            Element::Quoted(name) => format!("\"(?P<{name}>[^\",]*)\""),
        }
    }
}

const LTE_MEASUREMENTS: [Element; 16] = [
    Element::Bare("mcc"),
    Element::Bare("mnc"),
    Element::Bare("cell_id"),
    Element::Bare("pcid"),
    Element::Bare("earfcn"),
    Element::Bare("band"),
    Element::Bare("ul_bandwidth"),
    Element::Bare("dl_bandwidth"),
    Element::Bare("tac"),
    Element::Bare("rsrp"),
    Element::Bare("rsrq"),
    Element::Bare("rssi"),
    Element::Bare("sinr"),
    Element::Bare("cqi"),
    Element::Bare("tx_power"),
    Element::Bare("srxlev"),
];

const NR_NSA_ELEMENTS: [Element; 11] = [
    Element::Literal("\"NR5G-NSA\""),
    Element::Bare("mcc"),
    Element::Bare("mnc"),
    Element::Bare("pcid"),
    Element::Bare("rsrp"),
    Element::Bare("sinr"),
    Element::Bare("rsrq"),
    Element::Bare("arfcn"),
    Element::Bare("band"),
    Element::Bare("dl_bandwidth"),
    Element::Bare("scs"),
];

/// A named, anchored reply grammar producing records of one technology.
#[derive(Debug, Clone)]
pub struct LineGrammar {
    name: &'static str,
    tag: TechnologyTag,
    pattern: Regex,
}

impl LineGrammar {
    /// Build `+QENG: e1,e2,...[,t1,...]$` where the trailing group is optional as a whole.
    pub fn positional(
        name: &'static str,
        tag: TechnologyTag,
        elements: &[Element],
        optional_tail: &[Element],
    ) -> Result<Self, regex::Error> {
        let body: Vec<String> = elements.iter().map(|e| e.pattern()).collect();
        let mut pattern = format!("^{}{}", regex::escape(REPLY_PREFIX), body.join(","));
        if !optional_tail.is_empty() {
            let tail: Vec<String> = optional_tail.iter().map(|e| e.pattern()).collect();
            pattern.push_str(&format!("(?:,{})?", tail.join(",")));
        }
        pattern.push('$');
        Self::from_pattern(name, tag, &pattern)
    }

    pub fn from_pattern(
        name: &'static str,
        tag: TechnologyTag,
        pattern: &str,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name,
            tag,
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn tag(&self) -> TechnologyTag {
        self.tag
    }

    pub fn matches(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }

    /// Named captures of `line`; optional groups that did not participate are left out.
    pub fn decode(&self, line: &str) -> Option<FieldMap> {
        let captures = self.pattern.captures(line)?;
        let fields = self
            .pattern
            .capture_names()
            .flatten()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|value| (name.to_string(), value.as_str().to_string()))
            })
            .collect();
        Some(fields)
    }

    /// `+QENG: "LTE","FDD",...` as emitted alongside an NR5G-NSA line.
    pub fn lte_query_echo() -> Self {
        let mut elements = vec![Element::Literal("\"LTE\""), Element::Quoted("is_tdd")];
        elements.extend_from_slice(&LTE_MEASUREMENTS);
        Self::positional("LTE query-echo", TechnologyTag::Lte, &elements, &[])
            .expect("built-in LTE query-echo grammar is valid")
    }

    /// `+QENG: "servingcell","<state>","LTE","FDD",...[,dl_time]`.
    pub fn lte_serving_cell() -> Self {
        let mut elements = vec![
            Element::Literal("\"servingcell\""),
            Element::Quoted("state"),
            Element::Literal("\"LTE\""),
            Element::Quoted("is_tdd"),
        ];
        elements.extend_from_slice(&LTE_MEASUREMENTS);
        Self::positional(
            "LTE serving-cell",
            TechnologyTag::Lte,
            &elements,
            &[Element::Bare("dl_time")],
        )
        .expect("built-in LTE serving-cell grammar is valid")
    }

    /// `+QENG: "NR5G-NSA",...`.
    pub fn nr_nsa() -> Self {
        Self::positional("NR5G-NSA", TechnologyTag::Nr, &NR_NSA_ELEMENTS, &[])
            .expect("built-in NR5G-NSA grammar is valid")
    }
}

/// What a single reply line turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    Record(TechnologyRecord),
    /// Expected noise: the command echo or the no-serving-cell sentinel.
    Ignorable,
}

/// Decodes `AT+QENG="servingcell"` replies against a closed set of positional
/// grammars. A line matching more than one grammar of its family is reported as
/// a grammar bug and dropped, never resolved by pattern order.
#[derive(Debug, Clone)]
pub struct ServingCellParser {
    lte_echo: LineGrammar,
    lte_full: LineGrammar,
    nr_nsa: LineGrammar,
    echo: String,
}

impl Default for ServingCellParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ServingCellParser {
    pub fn new() -> Self {
        Self::with_grammars(
            LineGrammar::lte_query_echo(),
            LineGrammar::lte_serving_cell(),
            LineGrammar::nr_nsa(),
        )
    }

    pub fn with_grammars(lte_echo: LineGrammar, lte_full: LineGrammar, nr_nsa: LineGrammar) -> Self {
        Self {
            lte_echo,
            lte_full,
            nr_nsa,
            echo: SERVING_CELL_COMMAND.to_string(),
        }
    }

    /// Command text whose echo is ignored (the modem may run with `ATE1`).
    pub fn with_echo(mut self, command: impl Into<String>) -> Self {
        self.echo = command.into();
        self
    }

    pub fn classify_line(&self, line: &str) -> Result<LineClass, ParseError> {
        if line.contains(LTE_MARKER) {
            let fields = match (self.lte_echo.decode(line), self.lte_full.decode(line)) {
                (Some(fields), None) | (None, Some(fields)) => fields,
                (None, None) => {
                    return Err(ParseError::Unrecognized {
                        tag: TechnologyTag::Lte,
                        line: line.to_string(),
                    })
                }
                (Some(_), Some(_)) => {
                    return Err(ParseError::Ambiguous {
                        first: self.lte_echo.name(),
                        second: self.lte_full.name(),
                        line: line.to_string(),
                    })
                }
            };
            return Ok(LineClass::Record(TechnologyRecord::new(self.lte_echo.tag(), fields)));
        }

        if line.contains(NR_NSA_MARKER) {
            return match self.nr_nsa.decode(line) {
                Some(fields) => Ok(LineClass::Record(TechnologyRecord::new(self.nr_nsa.tag(), fields))),
                None => Err(ParseError::Unrecognized {
                    tag: TechnologyTag::Nr,
                    line: line.to_string(),
                }),
            };
        }

        if line == NO_SERVICE_SENTINEL || line == self.echo {
            return Ok(LineClass::Ignorable);
        }

        Err(ParseError::UnknownConnectionType(line.to_string()))
    }

    /// Decode a reply batch into at most one record per technology.
    ///
    /// Never fails: bad lines are logged and skipped, the rest still count.
    pub fn parse_serving_cell(&self, lines: &[RawLine]) -> Readings {
        let mut readings = Readings::new();

        for line in lines {
            match self.classify_line(line) {
                Ok(LineClass::Record(record)) => {
                    readings.insert(record.tag(), record);
                }
                Ok(LineClass::Ignorable) => trace!(line = %line, "ignoring reply line"),
                Err(e @ ParseError::Ambiguous { .. }) => error!(error = %e, "discarding reply line"),
                Err(e) => warn!(error = %e, "discarding reply line"),
            }
        }

        readings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_lte_grammars_are_disjoint() {
        let echo = LineGrammar::lte_query_echo();
        let full = LineGrammar::lte_serving_cell();
        let echo_line = "+QENG: \"LTE\",\"FDD\",302,720,99B815,0,675,2,4,4,73A0,-67,-6,-42,26,0,-,60";
        let full_line =
            "+QENG: \"servingcell\",\"NOCONN\",\"LTE\",\"FDD\",302,720,99B815,0,675,2,4,4,73A0,-67,-6,-42,26,0,-,60";

        assert!(echo.matches(echo_line) && !full.matches(echo_line));
        assert!(full.matches(full_line) && !echo.matches(full_line));
    }

    #[test]
    fn optional_tail_is_captured_only_when_present() {
        let full = LineGrammar::lte_serving_cell();
        let with_tail =
            "+QENG: \"servingcell\",\"CONNECT\",\"LTE\",\"TDD\",1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17";
        let fields = full.decode(with_tail).unwrap();
        assert_eq!(fields.get("dl_time").map(String::as_str), Some("17"));
        assert_eq!(fields.get("state").map(String::as_str), Some("CONNECT"));

        let without_tail =
            "+QENG: \"servingcell\",\"CONNECT\",\"LTE\",\"TDD\",1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16";
        let fields = full.decode(without_tail).unwrap();
        assert!(!fields.contains_key("dl_time"));
        assert_eq!(fields.len(), 18);
    }

    #[test]
    fn literal_elements_are_escaped() {
        let grammar = LineGrammar::positional(
            "dotted",
            TechnologyTag::Unknown,
            &[Element::Literal("a.b"), Element::Bare("x")],
            &[],
        )
        .unwrap();
        assert!(grammar.matches("+QENG: a.b,1"));
        assert!(!grammar.matches("+QENG: axb,1"));
    }
}
