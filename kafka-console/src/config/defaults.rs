use crate::properties::ClientKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const ENV_PREFIX: &str = "KAFKA_CONSOLE";

/// Environment wide client property defaults.
/// These sit below anything configured for an individual cluster or derived from its resource.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ClientDefaults {
    #[serde(default)]
    pub common: BTreeMap<String, String>,
    #[serde(default)]
    pub admin: BTreeMap<String, String>,
    #[serde(default)]
    pub consumer: BTreeMap<String, String>,
    #[serde(default)]
    pub producer: BTreeMap<String, String>,
}

impl ClientDefaults {
    fn for_kind(&self, kind: ClientKind) -> &BTreeMap<String, String> {
        match kind {
            ClientKind::Admin => &self.admin,
            ClientKind::Consumer => &self.consumer,
            ClientKind::Producer => &self.producer,
        }
    }

    /// Every property name that could have a default for this kind of client.
    pub fn names(&self, kind: ClientKind) -> impl Iterator<Item = &str> {
        let mut names: Vec<&str> = kind.known_properties().collect();
        names.extend(self.common.keys().map(String::as_str));
        names.extend(self.for_kind(kind).keys().map(String::as_str));
        names.sort_unstable();
        names.dedup();
        names.into_iter()
    }

    /// Looks up the default for a property of one kind of client.
    ///
    /// Kind specific defaults win over common defaults.
    /// At each level the environment variable wins over the configuration file.
    pub fn lookup(
        &self,
        kind: ClientKind,
        name: &str,
        env: &impl Fn(&str) -> Option<String>,
    ) -> Option<String> {
        env(&env_var_name(Some(kind), name))
            .or_else(|| self.for_kind(kind).get(name).cloned())
            .or_else(|| env(&env_var_name(None, name)))
            .or_else(|| self.common.get(name).cloned())
            .map(|value| unquote(&value).to_owned())
    }
}

/// `request.timeout.ms` for admin clients becomes `KAFKA_CONSOLE_ADMIN_REQUEST_TIMEOUT_MS`
pub(crate) fn env_var_name(kind: Option<ClientKind>, name: &str) -> String {
    let property: String = name
        .chars()
        .map(|c| match c {
            '.' | '-' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect();
    match kind {
        Some(kind) => format!("{ENV_PREFIX}_{}_{property}", kind.as_str().to_ascii_uppercase()),
        None => format!("{ENV_PREFIX}_{property}"),
    }
}

/// Strips one leading and one trailing quote character, `"` or `'`.
fn unquote(value: &str) -> &str {
    let value = value
        .strip_prefix('"')
        .or_else(|| value.strip_prefix('\''))
        .unwrap_or(value);
    value
        .strip_suffix('"')
        .or_else(|| value.strip_suffix('\''))
        .unwrap_or(value)
}
