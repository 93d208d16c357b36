pub const TOPIC_PREFIX: &str = "offset_thermostat";

/// Wildcard subscription covering every entity state topic.
pub const TOPIC_ENTITY_STATE_WILDCARD: &str = "offset_thermostat/entity/+/state";
/// Wildcard subscription covering every controller command topic.
pub const TOPIC_CONTROLLER_CMND_WILDCARD: &str = "offset_thermostat/controller/+/cmnd/+";

pub const CMND_TARGET: &str = "target";
pub const CMND_BOOST: &str = "boost";
pub const CMND_RESET: &str = "reset";
pub const CMND_TRIGGER: &str = "trigger";

pub fn entity_state_topic(entity: &str) -> String {
    format!("{TOPIC_PREFIX}/entity/{entity}/state")
}

pub fn entity_set_topic(entity: &str) -> String {
    format!("{TOPIC_PREFIX}/entity/{entity}/set")
}

pub fn controller_state_topic(id: &str) -> String {
    format!("{TOPIC_PREFIX}/controller/{id}/state")
}

pub fn controller_cmnd_topic(id: &str, command: &str) -> String {
    format!("{TOPIC_PREFIX}/controller/{id}/cmnd/{command}")
}

/// Topic classes the controller reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundTopic<'a> {
    EntityState { entity: &'a str },
    ControllerCommand { id: &'a str, command: &'a str },
}

pub fn parse_inbound(topic: &str) -> Option<InboundTopic<'_>> {
    let rest = topic.strip_prefix(TOPIC_PREFIX)?.strip_prefix('/')?;
    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        ["entity", entity, "state"] if !entity.is_empty() => {
            Some(InboundTopic::EntityState { entity: *entity })
        }
        ["controller", id, "cmnd", command] if !id.is_empty() => {
            Some(InboundTopic::ControllerCommand {
                id: *id,
                command: *command,
            })
        }
        _ => None,
    }
}
