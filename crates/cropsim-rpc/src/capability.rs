//! ---
//! cs_section: "02-rpc-pipeline"
//! cs_subsection: "module"
//! cs_type: "source"
//! cs_scope: "code"
//! cs_description: "Live and durable capability references, identity and persistence."
//! cs_version: "v0.0.0-prealpha"
//! cs_owner: "tbd"
//! ---
use std::fmt;

use capnp::capability::FromClientHook;
use cropsim_schema::{id_information, identifiable, persistent};
use serde::{Deserialize, Serialize};

use crate::error::RpcResult;
use crate::promise::Promise;

/// Interface a capability is expected to implement.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CapKind {
    /// Bootstrap object of the climate data service.
    DataService,
    Simulation,
    Scenario,
    Realization,
    Station,
    TimeSeries,
    AdminMaster,
    ModelFactory,
    /// Holder wrapping a provisioned instance; exposes `cap` and `save`.
    CapHolder,
    /// Holder of several instances provisioned in one request.
    HolderGroup,
    ModelInstance,
}

/// Whether a reference is directly invocable or must be restored first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Live,
    Durable,
}

/// Identity record every navigable object reports through `info`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl IdInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
        }
    }

    pub fn read(reader: id_information::Reader<'_>) -> RpcResult<Self> {
        Ok(Self {
            id: reader.get_id()?.to_str()?.to_owned(),
            name: reader.get_name()?.to_str()?.to_owned(),
            description: reader.get_description()?.to_str()?.to_owned(),
        })
    }

    pub fn write(&self, mut builder: id_information::Builder<'_>) {
        builder.set_id(&self.id);
        builder.set_name(&self.name);
        builder.set_description(&self.description);
    }
}

/// Ask any `Identifiable` capability for its identity.
pub fn identify(client: &capnp::capability::Client) -> Promise<IdInfo> {
    let identifiable = identifiable::Client::new(client.hook.add_ref());
    let response = identifiable.info_request().send().promise;
    Promise::new(async move {
        let response = response.await?;
        IdInfo::read(response.get()?)
    })
}

/// Ask a `Persistent` capability for a token that restores it later.
pub fn save(client: &capnp::capability::Client, kind: CapKind) -> Promise<SturdyRef> {
    let persistent = persistent::Client::new(client.hook.add_ref());
    let response = persistent.save_request().send().promise;
    Promise::new(async move {
        let response = response.await?;
        let token = response.get()?.get_sturdy_ref()?.to_str()?.to_owned();
        Ok(SturdyRef::new(token, kind))
    })
}

/// Serializable token that restores a capability independent of the
/// connection that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SturdyRef {
    pub token: String,
    /// Kind of the capability the token restores to.
    pub kind: CapKind,
}

impl SturdyRef {
    pub fn new(token: impl Into<String>, kind: CapKind) -> Self {
        Self {
            token: token.into(),
            kind,
        }
    }
}

impl fmt::Display for SturdyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.token)
    }
}

/// A reference in either liveness state.
#[derive(Debug, Clone)]
pub enum CapRef<C> {
    Live(C),
    Durable(SturdyRef),
}

impl<C> CapRef<C> {
    pub fn liveness(&self) -> Liveness {
        match self {
            CapRef::Live(_) => Liveness::Live,
            CapRef::Durable(_) => Liveness::Durable,
        }
    }
}

impl<C> From<SturdyRef> for CapRef<C> {
    fn from(sturdy: SturdyRef) -> Self {
        CapRef::Durable(sturdy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sturdy_refs_display_kind_and_token() {
        let sturdy = SturdyRef::new("3f2a", CapKind::CapHolder);
        assert_eq!(sturdy.to_string(), "cap_holder:3f2a");
        let json = serde_json::to_string(&sturdy).unwrap();
        assert_eq!(json, r#"{"token":"3f2a","kind":"cap_holder"}"#);
        let durable: CapRef<()> = sturdy.into();
        assert_eq!(durable.liveness(), Liveness::Durable);
        assert_eq!(CapRef::Live(()).liveness(), Liveness::Live);
    }

    #[test]
    fn id_info_defaults_missing_description() {
        let info: IdInfo = serde_json::from_str(r#"{"id":"rcp45","name":"RCP 4.5"}"#).unwrap();
        assert_eq!(info, IdInfo::new("rcp45", "RCP 4.5"));
    }
}
