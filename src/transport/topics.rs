//! Fixed MQTT topic layout of the server contract.
//!
//! The device publishes under `iotcs/{id}` and the server answers under
//! `devices/{id}`; an `/error` suffix on any expected topic carries an
//! error envelope instead of the regular reply.

pub(crate) const ERROR_SUFFIX: &str = "/error";

/// Topic the device publishes a request on, derived from the REST path.
/// Query strings never reach MQTT topics.
pub(crate) fn publish_topic(id: &str, rest_api: &str) -> String {
    format!("iotcs/{id}{}", strip_query(rest_api))
}

/// Topic the matching reply is expected on.
pub(crate) fn expected_topic(id: &str, rest_api: &str) -> String {
    format!("devices/{id}{}", strip_query(rest_api))
}

pub(crate) fn error_topic(expected: &str) -> String {
    format!("{expected}{ERROR_SUFFIX}")
}

/// Topic server-to-device requests arrive on.
pub(crate) fn inbound_messages_topic(id: &str) -> String {
    format!("devices/{id}/messages")
}

fn strip_query(rest_api: &str) -> &str {
    match rest_api.split_once('?') {
        Some((path, _)) => path,
        None => rest_api,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn topic_table_is_exact() {
        assert_eq!(
            publish_topic("client-1", "/activation/policy?OSName=Linux"),
            "iotcs/client-1/activation/policy"
        );
        assert_eq!(
            expected_topic("client-1", "/activation/policy?OSName=Linux"),
            "devices/client-1/activation/policy"
        );
        assert_eq!(
            publish_topic("client-1", "/activation/direct"),
            "iotcs/client-1/activation/direct"
        );
        assert_eq!(
            publish_topic("0-EP", "/activation/indirect/device"),
            "iotcs/0-EP/activation/indirect/device"
        );
        assert_eq!(
            publish_topic("0-EP", "/messages?acceptBytes=1024"),
            "iotcs/0-EP/messages"
        );
        assert_eq!(
            publish_topic("0-EP", "/deviceModels"),
            "iotcs/0-EP/deviceModels"
        );
        assert_eq!(
            expected_topic("0-EP", "/deviceModels"),
            "devices/0-EP/deviceModels"
        );
        assert_eq!(
            error_topic("devices/0-EP/deviceModels"),
            "devices/0-EP/deviceModels/error"
        );
        assert_eq!(inbound_messages_topic("0-EP"), "devices/0-EP/messages");
    }
}
