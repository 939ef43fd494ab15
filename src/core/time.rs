use time::{
    format_description::well_known::Rfc3339, macros::format_description, Date, Month,
    OffsetDateTime, PrimitiveDateTime,
};

pub(crate) fn primitive_now_utc() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

pub(crate) fn today_utc() -> Date {
    OffsetDateTime::now_utc().date()
}

pub(crate) fn format_primitive(value: PrimitiveDateTime) -> String {
    value.assume_utc().format(&Rfc3339).unwrap_or_else(|_| value.assume_utc().to_string())
}

/// Day-first rendering used on printed certificates, e.g. `15/01/2024`.
pub(crate) fn format_certificate_date(value: Date) -> String {
    let format = format_description!("[day]/[month]/[year]");
    value.format(&format).unwrap_or_else(|_| value.to_string())
}

pub(crate) fn format_iso_date(value: Date) -> String {
    let format = format_description!("[year]-[month]-[day]");
    value.format(&format).unwrap_or_else(|_| value.to_string())
}

pub(crate) fn parse_iso_date(value: &str) -> Option<Date> {
    let format = format_description!("[year]-[month]-[day]");
    Date::parse(value.trim(), &format).ok()
}

/// Calendar-year addition. 29 February rolls forward to 1 March when the
/// target year is not a leap year.
pub(crate) fn add_years(value: Date, years: i32) -> Date {
    let year = value.year() + years;
    match Date::from_calendar_date(year, value.month(), value.day()) {
        Ok(date) => date,
        Err(_) => Date::from_calendar_date(year, Month::March, 1).unwrap_or(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::{macros::date, Time};

    #[test]
    fn format_primitive_outputs_utc_z() {
        let date = Date::from_calendar_date(2025, Month::January, 2).unwrap();
        let time = Time::from_hms(10, 20, 30).unwrap();
        let value = PrimitiveDateTime::new(date, time);
        assert_eq!(format_primitive(value), "2025-01-02T10:20:30Z");
    }

    #[test]
    fn certificate_dates_are_day_first() {
        assert_eq!(format_certificate_date(date!(2024 - 01 - 15)), "15/01/2024");
        assert_eq!(format_certificate_date(date!(2027 - 12 - 03)), "03/12/2027");
    }

    #[test]
    fn add_years_keeps_day_and_month() {
        assert_eq!(add_years(date!(2024 - 01 - 15), 3), date!(2027 - 01 - 15));
    }

    #[test]
    fn add_years_rolls_leap_day_forward() {
        assert_eq!(add_years(date!(2024 - 02 - 29), 3), date!(2027 - 03 - 01));
        assert_eq!(add_years(date!(2024 - 02 - 29), 4), date!(2028 - 02 - 29));
    }

    #[test]
    fn parse_iso_date_rejects_garbage() {
        assert_eq!(parse_iso_date("2024-01-15"), Some(date!(2024 - 01 - 15)));
        assert_eq!(parse_iso_date("15/01/2024"), None);
        assert_eq!(parse_iso_date(""), None);
    }
}
