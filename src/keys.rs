//! Key layouts used by the flight-tracking buckets.

use skymirror_core::FULL_WILDCARD;
use skymirror_core::SINGLE_WILDCARD;

/// Root token of flight record keys.
pub const FLIGHTS_ROOT: &str = "flights";

const FLIGHT_KEY_FIELDS: usize = 10;

const FA_FLIGHT_ID: usize = 0;
const YEAR: usize = 1;
const MONTH: usize = 2;
const DAY: usize = 3;
const HOUR: usize = 4;
const IDENT: usize = 7;
const ORIGIN: usize = 8;
const DESTINATION: usize = 9;

/// Key marking `ident` as a flight owned by `user_id`.
pub fn owned_flight_key(user_id: &str, ident: &str) -> String {
    format!("users.{user_id}.flights.owned.{ident}")
}

/// Pattern matching every flight owned by `user_id`.
pub fn owned_flights_pattern(user_id: &str) -> String {
    format!("users.{user_id}.flights.owned.{FULL_WILDCARD}")
}

/// Builds watch and listing patterns over flight record keys.
///
/// Flight keys have the layout
/// `flights.{fa_flight_id}.{year}.{month}.{day}.{hour}.{min}.{sec}.{ident}.{origin}.{dest}`.
/// Every field starts as a single-token wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlightKeyFilter {
    fields: [String; FLIGHT_KEY_FIELDS],
}

impl Default for FlightKeyFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl FlightKeyFilter {
    pub fn new() -> Self {
        Self {
            fields: std::array::from_fn(|_| SINGLE_WILDCARD.to_string()),
        }
    }

    pub fn with_flight_id(mut self, fa_flight_id: &str) -> Self {
        self.fields[FA_FLIGHT_ID] = fa_flight_id.to_string();
        self
    }

    pub fn with_date(mut self, year: u16, month: u8, day: u8) -> Self {
        self.fields[YEAR] = format!("{year:04}");
        self.fields[MONTH] = format!("{month:02}");
        self.fields[DAY] = format!("{day:02}");
        self
    }

    pub fn with_hour(mut self, hour: u8) -> Self {
        self.fields[HOUR] = format!("{hour:02}");
        self
    }

    pub fn with_ident(mut self, ident: &str) -> Self {
        self.fields[IDENT] = ident.to_string();
        self
    }

    pub fn with_route(mut self, origin: &str, destination: &str) -> Self {
        self.fields[ORIGIN] = origin.to_string();
        self.fields[DESTINATION] = destination.to_string();
        self
    }

    pub fn with_destination(mut self, destination: &str) -> Self {
        self.fields[DESTINATION] = destination.to_string();
        self
    }

    /// Render the filter as a key pattern.
    ///
    /// Trailing wildcard fields are dropped. With `trailing_wildcard` the pattern ends in `>`,
    /// otherwise it ends at the last constrained field. A filter with no constrained field
    /// matches every flight key.
    pub fn build(&self, trailing_wildcard: bool) -> String {
        let constrained = self
            .fields
            .iter()
            .rposition(|field| field != SINGLE_WILDCARD)
            .map_or(0, |last| last + 1);
        if constrained == 0 {
            return format!("{FLIGHTS_ROOT}.{FULL_WILDCARD}");
        }

        let mut tokens = Vec::with_capacity(constrained + 2);
        tokens.push(FLIGHTS_ROOT);
        tokens.extend(self.fields[..constrained].iter().map(String::as_str));
        if trailing_wildcard && constrained < self.fields.len() {
            tokens.push(FULL_WILDCARD);
        }
        tokens.join(".")
    }
}
