use base64::{engine::general_purpose::STANDARD, Engine as _};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::access_key::Environment;

const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const RECEPTION_NS: &str = "http://ec.gob.sri.ws.recepcion";
pub const AUTHORIZATION_NS: &str = "http://ec.gob.sri.ws.autorizacion";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthorityMessage {
    pub identifier: Option<String>,
    pub message: Option<String>,
    pub additional_info: Option<String>,
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceptionResponse {
    pub state: Option<String>,
    pub messages: Vec<AuthorityMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthorizationEntry {
    pub state: Option<String>,
    pub authorization_number: Option<String>,
    pub authorized_at: Option<String>,
    pub environment: Option<String>,
    pub document: Option<String>,
    pub messages: Vec<AuthorityMessage>,
}

pub fn reception_envelope(document: &[u8]) -> Result<Vec<u8>, quick_xml::Error> {
    envelope(
        RECEPTION_NS,
        "validarComprobante",
        "xml",
        &STANDARD.encode(document),
    )
}

pub fn authorization_envelope(access_key: &str) -> Result<Vec<u8>, quick_xml::Error> {
    envelope(
        AUTHORIZATION_NS,
        "autorizacionComprobante",
        "claveAccesoComprobante",
        access_key,
    )
}

fn envelope(
    namespace: &str,
    operation: &str,
    field: &str,
    value: &str,
) -> Result<Vec<u8>, quick_xml::Error> {
    let mut writer = Writer::new(Vec::new());

    let mut root = BytesStart::new("soapenv:Envelope");
    root.push_attribute(("xmlns:soapenv", SOAP_ENV_NS));
    root.push_attribute(("xmlns:ec", namespace));
    writer.write_event(Event::Start(root))?;
    writer.write_event(Event::Empty(BytesStart::new("soapenv:Header")))?;
    writer.write_event(Event::Start(BytesStart::new("soapenv:Body")))?;

    let operation = format!("ec:{operation}");
    writer.write_event(Event::Start(BytesStart::new(operation.as_str())))?;
    writer.write_event(Event::Start(BytesStart::new(field)))?;
    writer.write_event(Event::Text(BytesText::new(value)))?;
    writer.write_event(Event::End(BytesEnd::new(field)))?;
    writer.write_event(Event::End(BytesEnd::new(operation.as_str())))?;

    writer.write_event(Event::End(BytesEnd::new("soapenv:Body")))?;
    writer.write_event(Event::End(BytesEnd::new("soapenv:Envelope")))?;

    Ok(writer.into_inner())
}

/// Minimal element tree keyed by local names; namespaces are ignored.
#[derive(Debug, Default)]
struct Node {
    name: String,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|child| child.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    fn descendant(&self, name: &str) -> Option<&Node> {
        for child in &self.children {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.descendant(name) {
                return Some(found);
            }
        }
        None
    }

    fn text_of(&self, name: &str) -> Option<String> {
        self.child(name)
            .map(|child| child.text.trim().to_string())
            .filter(|text| !text.is_empty())
    }
}

fn parse_tree(body: &[u8]) -> Result<Node, quick_xml::Error> {
    let mut reader = Reader::from_reader(body);
    let mut buf = Vec::new();
    let mut stack = vec![Node {
        name: "#document".into(),
        ..Node::default()
    }];

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(start) => stack.push(Node {
                name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
                ..Node::default()
            }),
            Event::Empty(empty) => {
                let node = Node {
                    name: String::from_utf8_lossy(empty.local_name().as_ref()).into_owned(),
                    ..Node::default()
                };
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Event::End(_) => {
                if stack.len() > 1 {
                    if let Some(node) = stack.pop() {
                        if let Some(parent) = stack.last_mut() {
                            parent.children.push(node);
                        }
                    }
                }
            }
            Event::Text(text) => {
                let text = text.unescape()?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    while stack.len() > 1 {
        if let Some(node) = stack.pop() {
            if let Some(parent) = stack.last_mut() {
                parent.children.push(node);
            }
        }
    }

    Ok(stack.pop().unwrap_or_default())
}

fn messages_of(node: &Node) -> Vec<AuthorityMessage> {
    node.child("mensajes")
        .map(|list| {
            list.children_named("mensaje")
                .map(|entry| AuthorityMessage {
                    identifier: entry.text_of("identificador"),
                    message: entry.text_of("mensaje"),
                    additional_info: entry.text_of("informacionAdicional"),
                    kind: entry.text_of("tipo"),
                })
                .collect()
        })
        .unwrap_or_default()
}

pub fn fault_string(body: &str) -> Option<String> {
    let tree = parse_tree(body.as_bytes()).ok()?;
    let fault = tree.descendant("Fault")?;
    Some(
        fault
            .text_of("faultstring")
            .unwrap_or_else(|| "unspecified SOAP fault".to_string()),
    )
}

/// `None` when the body does not carry a reception answer at all.
pub fn parse_reception(body: &str) -> Result<Option<ReceptionResponse>, quick_xml::Error> {
    let tree = parse_tree(body.as_bytes())?;
    let Some(response) = tree.descendant("RespuestaRecepcionComprobante") else {
        return Ok(None);
    };

    let messages = response
        .child("comprobantes")
        .and_then(|list| list.child("comprobante"))
        .map(messages_of)
        .unwrap_or_default();

    Ok(Some(ReceptionResponse {
        state: response.text_of("estado"),
        messages,
    }))
}

/// `None` when the body does not carry an authorization answer at all.
pub fn parse_authorization(
    body: &str,
) -> Result<Option<Vec<AuthorizationEntry>>, quick_xml::Error> {
    let tree = parse_tree(body.as_bytes())?;
    let Some(response) = tree.descendant("RespuestaAutorizacionComprobante") else {
        return Ok(None);
    };

    let entries = response
        .child("autorizaciones")
        .map(|list| {
            list.children_named("autorizacion")
                .map(|entry| AuthorizationEntry {
                    state: entry.text_of("estado"),
                    authorization_number: entry.text_of("numeroAutorizacion"),
                    authorized_at: entry.text_of("fechaAutorizacion"),
                    environment: entry.text_of("ambiente"),
                    document: entry.text_of("comprobante"),
                    messages: messages_of(entry),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Some(entries))
}

/// Reads the environment digit the document was signed for.
pub fn read_environment(document: &[u8]) -> Result<Environment, String> {
    let mut reader = Reader::from_reader(document);
    let mut buf = Vec::new();
    let mut inside = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) if start.local_name().as_ref() == b"ambiente" => {
                inside = true;
            }
            Ok(Event::Text(text)) if inside => {
                let value = text
                    .unescape()
                    .map_err(|err| format!("unreadable ambiente element: {err}"))?;
                return Environment::from_code(&value)
                    .ok_or_else(|| format!("invalid ambiente value {:?}", value.trim()));
            }
            Ok(Event::End(_)) if inside => return Err("empty ambiente element".into()),
            Ok(Event::Eof) => return Err("document has no ambiente element".into()),
            Err(err) => return Err(format!("unreadable document: {err}")),
            _ => {}
        }
        buf.clear();
    }
}
