/// Window contact states that count as open.
const OPEN_STATES: [&str; 4] = ["on", "open", "true", "1"];

pub fn is_open_state(raw: &str) -> bool {
    let trimmed = raw.trim();
    OPEN_STATES
        .iter()
        .any(|open| trimmed.eq_ignore_ascii_case(open))
}

/// Open when any watched sensor reports an open state. Sensors without a
/// known state are ignored.
pub fn any_open<'a, I, F>(entities: I, mut read: F) -> bool
where
    I: IntoIterator<Item = &'a String>,
    F: FnMut(&str) -> Option<String>,
{
    entities
        .into_iter()
        .filter_map(|entity| read(entity))
        .any(|state| is_open_state(&state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn open_states_are_case_insensitive() {
        for raw in ["on", "OPEN", "True", "1", " on "] {
            assert!(is_open_state(raw), "{raw}");
        }
        for raw in ["off", "closed", "0", "unavailable", ""] {
            assert!(!is_open_state(raw), "{raw}");
        }
    }

    #[test]
    fn any_sensor_open_opens_aggregate() {
        let states: HashMap<&str, &str> =
            HashMap::from([("binary_sensor.a", "off"), ("binary_sensor.b", "on")]);
        let read = |entity: &str| states.get(entity).map(|state| state.to_string());

        let both = vec!["binary_sensor.a".to_string(), "binary_sensor.b".to_string()];
        let closed_only = vec!["binary_sensor.a".to_string(), "binary_sensor.c".to_string()];

        assert!(any_open(&both, read));
        assert!(!any_open(&closed_only, read));
        assert!(!any_open(&Vec::new(), read));
    }
}
