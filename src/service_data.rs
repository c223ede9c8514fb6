//! A resolved mDNS/DNS-SD service instance (spec.md §3).

/// A single resolved service instance, as delivered to
/// [`crate::discovery::ServiceDiscovery`]'s `on_discovered`/`on_disappeared`
/// observers. Immutable once emitted; a service that changes its TXT
/// record is represented by a fresh `ServiceData` replacing the old one
/// under the same `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceData {
    /// Unique (per browser) instance name, e.g. `"machinekit on host"`.
    pub name: String,
    /// From TXT key `service=`.
    pub service_type: Option<String>,
    /// From TXT key `dsn=` — the transport endpoint URI. Absence means
    /// the record is not usable; callers must check before connecting.
    pub dsn: Option<String>,
    /// From TXT key `uuid=`.
    pub uuid: Option<String>,
    /// From TXT key `instance=`.
    pub instance: Option<String>,
    /// Raw `key=value` TXT strings, in the order Avahi reported them.
    pub txts: Vec<String>,
}

impl ServiceData {
    /// Parse a resolved service's raw TXT record array into a
    /// `ServiceData`. `name` and `txts` are taken from the resolve
    /// callback as-is; the four recognized keys (spec.md §4.C) are
    /// extracted on a best-effort basis, unrecognized keys are kept in
    /// `txts` but otherwise ignored.
    pub fn from_txt_records(name: String, txts: Vec<String>) -> Self {
        let mut data = ServiceData {
            name,
            service_type: None,
            dsn: None,
            uuid: None,
            instance: None,
            txts: txts.clone(),
        };
        for txt in &txts {
            let Some((key, value)) = txt.split_once('=') else {
                continue;
            };
            match key {
                "dsn" => data.dsn = Some(value.to_string()),
                "service" => data.service_type = Some(value.to_string()),
                "instance" => data.instance = Some(value.to_string()),
                "uuid" => data.uuid = Some(value.to_string()),
                _ => {}
            }
        }
        data
    }

    /// True iff `filter` is empty (accept-any) or equals this record's
    /// `uuid=` value exactly (spec.md §4.C step 2).
    pub fn matches_uuid_filter(&self, filter: &str) -> bool {
        filter.is_empty() || self.uuid.as_deref() == Some(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_recognized_keys() {
        let data = ServiceData::from_txt_records(
            "inst".to_string(),
            vec![
                "dsn=tcp://host:5000".to_string(),
                "service=halrcmd".to_string(),
                "instance=machinekit".to_string(),
                "uuid=abc-123".to_string(),
                "ignored=other".to_string(),
            ],
        );
        assert_eq!(data.dsn.as_deref(), Some("tcp://host:5000"));
        assert_eq!(data.service_type.as_deref(), Some("halrcmd"));
        assert_eq!(data.instance.as_deref(), Some("machinekit"));
        assert_eq!(data.uuid.as_deref(), Some("abc-123"));
        assert_eq!(data.txts.len(), 5);
    }

    #[test]
    fn missing_dsn_is_still_delivered() {
        let data = ServiceData::from_txt_records("inst".to_string(), vec!["uuid=x".to_string()]);
        assert!(data.dsn.is_none());
        assert_eq!(data.uuid.as_deref(), Some("x"));
    }

    #[test]
    fn uuid_filter_empty_accepts_any() {
        let data = ServiceData::from_txt_records("inst".to_string(), vec!["uuid=x".to_string()]);
        assert!(data.matches_uuid_filter(""));
        assert!(data.matches_uuid_filter("x"));
        assert!(!data.matches_uuid_filter("y"));
    }
}
