//! XML-RPC client for the supervisor control interface.
//!
//! Only the handful of `supervisor.*` methods the sequencer needs are
//! exposed, behind the [`SupervisorRpc`] trait so the scheduler can be
//! driven against a fake in tests.
use std::{collections::BTreeMap, env, fmt::Write as _};

use quick_xml::{Reader, escape::escape, events::Event};
use thiserror::Error;

/// Environment variable supervisor sets for its child processes, pointing at
/// the control endpoint.
pub const SERVER_URL_ENV: &str = "SUPERVISOR_SERVER_URL";

/// Endpoint used when `SUPERVISOR_SERVER_URL` is not set.
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:9001/RPC2";

/// Errors raised by the supervisor RPC channel.
#[derive(Debug, Error)]
pub enum RpcError {
    /// HTTP transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Malformed XML in the response body.
    #[error("malformed XML-RPC response: {0}")]
    Parse(#[from] quick_xml::Error),

    /// Structurally valid XML that does not form the expected payload.
    #[error("unexpected XML-RPC payload: {0}")]
    Protocol(String),

    /// A fault returned by the supervisor (e.g. BAD_NAME, ALREADY_STARTED).
    #[error("supervisor fault {code}: {message}")]
    Fault {
        /// Numeric fault code.
        code: i64,
        /// Fault description.
        message: String,
    },

    /// The configured endpoint is not an HTTP(S) URL.
    #[error("unsupported supervisor URL '{0}' (expected http or https)")]
    UnsupportedUrl(String),
}

/// An XML-RPC value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Str(String),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// Struct field lookup.
    pub fn get(&self, field: &str) -> Option<&Value> {
        match self {
            Value::Struct(fields) => fields.get(field),
            _ => None,
        }
    }

    fn require_str(&self, field: &str) -> Result<String, RpcError> {
        self.get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                RpcError::Protocol(format!("missing string field '{field}'"))
            })
    }
}

/// A process entry from `getProcessInfo`/`getAllProcessInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Process name.
    pub name: String,
    /// Group the process belongs to.
    pub group: String,
    /// State name as reported by supervisor (e.g. `RUNNING`).
    pub statename: String,
}

impl ProcessInfo {
    fn from_value(value: &Value) -> Result<Self, RpcError> {
        Ok(Self {
            name: value.require_str("name")?,
            group: value.require_str("group")?,
            statename: value.require_str("statename")?,
        })
    }
}

/// A config entry from `getAllConfigInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigInfo {
    /// Process name.
    pub name: String,
    /// Declared group of the process.
    pub group: String,
}

impl ConfigInfo {
    fn from_value(value: &Value) -> Result<Self, RpcError> {
        Ok(Self {
            name: value.require_str("name")?,
            group: value.require_str("group")?,
        })
    }
}

/// The supervisor control surface consumed by the sequencer.
pub trait SupervisorRpc {
    /// Returns the supervisor RPC API version string.
    fn api_version(&self) -> Result<String, RpcError>;

    /// Starts a single process. `name` may be `group:process`.
    fn start_process(&self, name: &str, wait: bool) -> Result<bool, RpcError>;

    /// Starts every process in a group.
    fn start_process_group(&self, name: &str, wait: bool) -> Result<bool, RpcError>;

    /// Fetches the current info for one process.
    fn get_process_info(&self, name: &str) -> Result<ProcessInfo, RpcError>;

    /// Fetches the current info for all processes.
    fn get_all_process_info(&self) -> Result<Vec<ProcessInfo>, RpcError>;

    /// Fetches the declared name/group pairs for all processes.
    fn get_all_config_info(&self) -> Result<Vec<ConfigInfo>, RpcError>;
}

/// Blocking XML-RPC client speaking to supervisord over HTTP.
pub struct XmlRpcClient {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl XmlRpcClient {
    /// Builds a client from `SUPERVISOR_SERVER_URL`, falling back to the
    /// default local endpoint.
    pub fn from_env() -> Result<Self, RpcError> {
        let url =
            env::var(SERVER_URL_ENV).unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string());
        Self::new(&url)
    }

    /// Builds a client for the given HTTP(S) endpoint. A missing `/RPC2`
    /// suffix is appended.
    pub fn new(url: &str) -> Result<Self, RpcError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(RpcError::UnsupportedUrl(url.to_string()));
        }
        let endpoint = if url.ends_with("/RPC2") {
            url.to_string()
        } else {
            format!("{}/RPC2", url.trim_end_matches('/'))
        };
        Ok(Self {
            endpoint,
            client: reqwest::blocking::Client::new(),
        })
    }

    fn call(&self, method: &str, params: &[Value]) -> Result<Value, RpcError> {
        let body = build_request(method, params);
        let response = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "text/xml")
            .body(body)
            .send()?
            .text()?;
        parse_response(&response)
    }
}

impl SupervisorRpc for XmlRpcClient {
    fn api_version(&self) -> Result<String, RpcError> {
        let value = self.call("supervisor.getAPIVersion", &[])?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::Protocol("API version is not a string".into()))
    }

    fn start_process(&self, name: &str, wait: bool) -> Result<bool, RpcError> {
        let value = self.call(
            "supervisor.startProcess",
            &[Value::Str(name.to_string()), Value::Bool(wait)],
        )?;
        value
            .as_bool()
            .ok_or_else(|| RpcError::Protocol("startProcess result is not boolean".into()))
    }

    fn start_process_group(&self, name: &str, wait: bool) -> Result<bool, RpcError> {
        // startProcessGroup returns an array of per-process results; reaching
        // the supervisor without a fault counts as accepted.
        self.call(
            "supervisor.startProcessGroup",
            &[Value::Str(name.to_string()), Value::Bool(wait)],
        )?;
        Ok(true)
    }

    fn get_process_info(&self, name: &str) -> Result<ProcessInfo, RpcError> {
        let value =
            self.call("supervisor.getProcessInfo", &[Value::Str(name.to_string())])?;
        ProcessInfo::from_value(&value)
    }

    fn get_all_process_info(&self) -> Result<Vec<ProcessInfo>, RpcError> {
        let value = self.call("supervisor.getAllProcessInfo", &[])?;
        match value {
            Value::Array(items) => {
                items.iter().map(ProcessInfo::from_value).collect()
            }
            _ => Err(RpcError::Protocol("getAllProcessInfo did not return an array".into())),
        }
    }

    fn get_all_config_info(&self) -> Result<Vec<ConfigInfo>, RpcError> {
        let value = self.call("supervisor.getAllConfigInfo", &[])?;
        match value {
            Value::Array(items) => items.iter().map(ConfigInfo::from_value).collect(),
            _ => Err(RpcError::Protocol("getAllConfigInfo did not return an array".into())),
        }
    }
}

/// Serialises a method call body.
fn build_request(method: &str, params: &[Value]) -> String {
    let mut body = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    body.push_str(&escape(method));
    body.push_str("</methodName><params>");
    for param in params {
        body.push_str("<param>");
        write_value(&mut body, param);
        body.push_str("</param>");
    }
    body.push_str("</params></methodCall>");
    body
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Int(i) => {
            let _ = write!(out, "<value><int>{i}</int></value>");
        }
        Value::Bool(b) => {
            let _ = write!(out, "<value><boolean>{}</boolean></value>", *b as u8);
        }
        Value::Str(s) => {
            let _ = write!(out, "<value><string>{}</string></value>", escape(s));
        }
        Value::Array(items) => {
            out.push_str("<value><array><data>");
            for item in items {
                write_value(out, item);
            }
            out.push_str("</data></array></value>");
        }
        Value::Struct(fields) => {
            out.push_str("<value><struct>");
            for (name, item) in fields {
                let _ = write!(out, "<member><name>{}</name>", escape(name));
                write_value(out, item);
                out.push_str("</member>");
            }
            out.push_str("</struct></value>");
        }
    }
}

/// Parses a method response body into its single value, or a typed fault.
fn parse_response(xml: &str) -> Result<Value, RpcError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut in_fault = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.name().as_ref() {
                b"fault" => in_fault = true,
                b"value" => {
                    let value = parse_value(&mut reader)?;
                    if in_fault {
                        let code = value
                            .get("faultCode")
                            .and_then(Value::as_i64)
                            .unwrap_or_default();
                        let message = value
                            .get("faultString")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        return Err(RpcError::Fault { code, message });
                    }
                    return Ok(value);
                }
                _ => {}
            },
            Event::Eof => {
                return Err(RpcError::Protocol("response contained no value".into()));
            }
            _ => {}
        }
    }
}

/// Parses one `<value>` element; the opening tag has already been consumed.
fn parse_value(reader: &mut Reader<&[u8]>) -> Result<Value, RpcError> {
    let mut value: Option<Value> = None;
    let mut text = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.name().as_ref() {
                b"string" => {
                    value = Some(Value::Str(reader.read_text(e.name())?.into_owned()));
                }
                b"int" | b"i4" | b"i8" => {
                    let raw = reader.read_text(e.name())?;
                    let parsed = raw.trim().parse::<i64>().map_err(|err| {
                        RpcError::Protocol(format!(
                            "invalid integer '{}': {err}",
                            raw.trim()
                        ))
                    })?;
                    value = Some(Value::Int(parsed));
                }
                b"boolean" => {
                    let raw = reader.read_text(e.name())?;
                    value = Some(Value::Bool(matches!(raw.trim(), "1" | "true")));
                }
                b"struct" => value = Some(Value::Struct(parse_struct(reader)?)),
                b"array" => value = Some(Value::Array(parse_array(reader)?)),
                // Scalar types we have no use for (double, dateTime.iso8601,
                // base64) carry their text through as strings.
                _ => {
                    value = Some(Value::Str(reader.read_text(e.name())?.into_owned()));
                }
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"boolean" => value = Some(Value::Bool(false)),
                b"int" | b"i4" | b"i8" => value = Some(Value::Int(0)),
                _ => value = Some(Value::Str(String::new())),
            },
            Event::Text(t) => {
                text = t.unescape()?.into_owned();
            }
            Event::End(e) if e.name().as_ref() == b"value" => {
                // An untyped <value>text</value> is a string.
                return Ok(value.unwrap_or(Value::Str(text)));
            }
            Event::Eof => {
                return Err(RpcError::Protocol("truncated XML-RPC value".into()));
            }
            _ => {}
        }
    }
}

fn parse_struct(reader: &mut Reader<&[u8]>) -> Result<BTreeMap<String, Value>, RpcError> {
    let mut fields = BTreeMap::new();
    let mut current_name: Option<String> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.name().as_ref() {
                b"name" => {
                    current_name = Some(reader.read_text(e.name())?.into_owned());
                }
                b"value" => {
                    let value = parse_value(reader)?;
                    if let Some(name) = current_name.take() {
                        fields.insert(name, value);
                    }
                }
                _ => {}
            },
            Event::End(e) if e.name().as_ref() == b"struct" => return Ok(fields),
            Event::Eof => {
                return Err(RpcError::Protocol("truncated XML-RPC struct".into()));
            }
            _ => {}
        }
    }
}

fn parse_array(reader: &mut Reader<&[u8]>) -> Result<Vec<Value>, RpcError> {
    let mut items = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"value" => {
                items.push(parse_value(reader)?);
            }
            Event::End(e) if e.name().as_ref() == b"array" => return Ok(items),
            Event::Eof => {
                return Err(RpcError::Protocol("truncated XML-RPC array".into()));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_escapes_values() {
        let body = build_request(
            "supervisor.startProcess",
            &[Value::Str("group:proc<1>".into()), Value::Bool(false)],
        );
        assert_eq!(
            body,
            "<?xml version=\"1.0\"?><methodCall>\
             <methodName>supervisor.startProcess</methodName>\
             <params><param><value><string>group:proc&lt;1&gt;</string></value></param>\
             <param><value><boolean>0</boolean></value></param></params></methodCall>"
        );
    }

    #[test]
    fn parses_boolean_response() {
        let xml = r#"<?xml version="1.0"?>
<methodResponse><params><param>
  <value><boolean>1</boolean></value>
</param></params></methodResponse>"#;
        assert_eq!(parse_response(xml).unwrap(), Value::Bool(true));
    }

    #[test]
    fn parses_untyped_value_as_string() {
        let xml = "<methodResponse><params><param><value>3.0</value></param></params></methodResponse>";
        assert_eq!(parse_response(xml).unwrap(), Value::Str("3.0".into()));
    }

    #[test]
    fn parses_array_of_structs() {
        let xml = r#"<methodResponse><params><param><value><array><data>
  <value><struct>
    <member><name>name</name><value><string>db</string></value></member>
    <member><name>group</name><value><string>backend</string></value></member>
    <member><name>statename</name><value><string>RUNNING</string></value></member>
    <member><name>pid</name><value><int>4711</int></value></member>
  </struct></value>
</data></array></value></param></params></methodResponse>"#;

        let value = parse_response(xml).unwrap();
        let Value::Array(items) = &value else {
            panic!("expected array");
        };
        assert_eq!(items.len(), 1);

        let info = ProcessInfo::from_value(&items[0]).unwrap();
        assert_eq!(
            info,
            ProcessInfo {
                name: "db".into(),
                group: "backend".into(),
                statename: "RUNNING".into(),
            }
        );
        assert_eq!(items[0].get("pid").and_then(Value::as_i64), Some(4711));
    }

    #[test]
    fn fault_surfaces_as_typed_error() {
        let xml = r#"<methodResponse><fault><value><struct>
  <member><name>faultCode</name><value><int>60</int></value></member>
  <member><name>faultString</name><value><string>ALREADY_STARTED: db</string></value></member>
</struct></value></fault></methodResponse>"#;

        match parse_response(xml).unwrap_err() {
            RpcError::Fault { code, message } => {
                assert_eq!(code, 60);
                assert_eq!(message, "ALREADY_STARTED: db");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_struct_field_is_protocol_error() {
        let value = Value::Struct(BTreeMap::from([(
            "name".to_string(),
            Value::Str("db".into()),
        )]));
        assert!(matches!(
            ProcessInfo::from_value(&value),
            Err(RpcError::Protocol(_))
        ));
    }

    #[test]
    fn rejects_non_http_endpoint() {
        assert!(matches!(
            XmlRpcClient::new("unix:///var/run/supervisor.sock"),
            Err(RpcError::UnsupportedUrl(_))
        ));
    }

    #[test]
    fn appends_rpc2_suffix() {
        let client = XmlRpcClient::new("http://127.0.0.1:9001").unwrap();
        assert_eq!(client.endpoint, "http://127.0.0.1:9001/RPC2");
    }
}
