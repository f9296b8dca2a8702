//! Session parameters and call configuration.

use crate::error::{Result, WebCallError};
use crate::media::AudioConstraints;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Length of generated conversation and session identifiers.
pub const GENERATED_ID_LEN: usize = 15;

/// Path of the call signaling endpoint on the call service.
pub const WEBRTC_CALL_PATH: &str = "/webrtc-call";

/// Environment variable read by [`EnvEndpoint`].
pub const ENDPOINT_ENV_VAR: &str = "ADK_WEBCALL_URL";

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a random lowercase base-36 identifier.
///
/// Not cryptographically strong; collisions are tolerated by the call service.
pub fn generate_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char).collect()
}

/// Input to [`WebCall::init`](crate::WebCall::init).
///
/// Every field is optional at the type level; missing identity fields are
/// reported by [`SessionParams::resolve`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInit {
    /// Agent to connect to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Region the agent is served from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Conversation ID; generated when absent.
    #[serde(rename = "convoId", alias = "conversationId", skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Session ID; generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Opaque options forwarded to the call service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Map<String, Value>>,
}

impl CallInit {
    /// Create an input with the two required identity fields.
    pub fn new(agent_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self { agent_id: Some(agent_id.into()), region: Some(region.into()), ..Default::default() }
    }

    /// Set the conversation ID.
    pub fn with_conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    /// Set the session ID.
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Set the pass-through options.
    pub fn with_options(mut self, options: Map<String, Value>) -> Self {
        self.options = Some(options);
        self
    }

    /// Add a single pass-through option.
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.get_or_insert_with(Map::new).insert(key.into(), value);
        self
    }
}

/// Identity and options of a call session, resolved once by `init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionParams {
    /// Agent to connect to.
    pub agent_id: String,
    /// Region the agent is served from.
    pub region: String,
    /// Conversation ID.
    #[serde(rename = "convoId")]
    pub conversation_id: String,
    /// Session ID.
    pub session_id: String,
    /// Opaque options forwarded to the call service.
    pub options: Map<String, Value>,
}

impl SessionParams {
    /// Validate an [`CallInit`] and fill in generated identifiers.
    ///
    /// Fails with [`WebCallError::ConfigurationError`] when `agent_id` or
    /// `region` is missing or empty.
    pub fn resolve(input: CallInit) -> Result<Self> {
        let agent_id = non_empty(input.agent_id);
        let region = non_empty(input.region);
        let (Some(agent_id), Some(region)) = (agent_id, region) else {
            return Err(WebCallError::config("Agent ID and region are required"));
        };

        Ok(Self {
            agent_id,
            region,
            conversation_id: non_empty(input.conversation_id)
                .unwrap_or_else(|| generate_id(GENERATED_ID_LEN)),
            session_id: non_empty(input.session_id)
                .unwrap_or_else(|| generate_id(GENERATED_ID_LEN)),
            options: input.options.unwrap_or_default(),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// A STUN/TURN server handed to the negotiation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:` or `turn:`).
    pub urls: Vec<String>,
    /// Username (TURN only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Credential (TURN only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A STUN server without credentials.
    pub fn stun(url: impl Into<String>) -> Self {
        Self { urls: vec![url.into()], username: None, credential: None }
    }

    /// A TURN server with credentials.
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

impl Default for IceServer {
    fn default() -> Self {
        Self::stun("stun:stun.l.google.com:19302")
    }
}

/// Configuration of the call controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebCallConfig {
    /// ICE servers passed to the negotiation engine.
    pub ice_servers: Vec<IceServer>,
    /// Local capture constraints.
    pub audio: AudioConstraints,
    /// Publish `volume-level` events while a call is live.
    pub volume_metering: bool,
    /// Metering ticks per second.
    pub meter_fps: u32,
}

impl Default for WebCallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::default()],
            audio: AudioConstraints::default(),
            volume_metering: false,
            meter_fps: 60,
        }
    }
}

impl WebCallConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the ICE server list.
    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// Add an ICE server.
    pub fn with_ice_server(mut self, server: IceServer) -> Self {
        self.ice_servers.push(server);
        self
    }

    /// Set capture constraints.
    pub fn with_audio(mut self, audio: AudioConstraints) -> Self {
        self.audio = audio;
        self
    }

    /// Enable volume metering at the given rate.
    pub fn with_volume_metering(mut self, fps: u32) -> Self {
        self.volume_metering = true;
        self.meter_fps = fps.max(1);
        self
    }
}

/// Derives the signaling endpoint URL for a session.
pub trait EndpointResolver: Send + Sync {
    /// Resolve the URL the signaling link should open.
    fn resolve(&self, params: &SessionParams) -> Result<String>;
}

impl<F> EndpointResolver for F
where
    F: Fn(&SessionParams) -> Result<String> + Send + Sync,
{
    fn resolve(&self, params: &SessionParams) -> Result<String> {
        self(params)
    }
}

/// Shared resolver type.
pub type BoxedResolver = Arc<dyn EndpointResolver>;

/// Always resolves to the same URL.
#[derive(Debug, Clone)]
pub struct StaticEndpoint(pub String);

impl EndpointResolver for StaticEndpoint {
    fn resolve(&self, _params: &SessionParams) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Substitutes `{region}` in a URL template.
#[derive(Debug, Clone)]
pub struct RegionEndpoint {
    template: String,
}

impl RegionEndpoint {
    /// Create a resolver from a template such as `wss://{region}.calls.example.com/webrtc-call`.
    pub fn new(template: impl Into<String>) -> Self {
        Self { template: template.into() }
    }

    /// Resolver for `wss://<host>/webrtc-call`, where `host` may contain `{region}`.
    pub fn call_service(host: &str) -> Self {
        Self::new(format!("wss://{host}{WEBRTC_CALL_PATH}"))
    }
}

impl EndpointResolver for RegionEndpoint {
    fn resolve(&self, params: &SessionParams) -> Result<String> {
        Ok(self.template.replace("{region}", &params.region))
    }
}

/// Reads a URL template from an environment variable at call start.
#[derive(Debug, Clone)]
pub struct EnvEndpoint {
    var: String,
}

impl EnvEndpoint {
    /// Read from [`ENDPOINT_ENV_VAR`].
    pub fn new() -> Self {
        Self::from_var(ENDPOINT_ENV_VAR)
    }

    /// Read from a custom variable.
    pub fn from_var(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointResolver for EnvEndpoint {
    fn resolve(&self, params: &SessionParams) -> Result<String> {
        let template = std::env::var(&self.var)
            .map_err(|_| WebCallError::config(format!("{} is not set", self.var)))?;
        RegionEndpoint::new(template).resolve(params)
    }
}
