//! Introspection data: the XML parser and the node structure cached per
//! connection.
//!
//! The parser is deliberately tolerant: unknown elements and attributes
//! (annotations, docs, future extensions) are skipped, not rejected.

use xmlparser::{ElementEnd, Token, Tokenizer};

use crate::Error;

/// One introspected object: its child nodes and the interfaces it
/// implements.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub children: Vec<String>,
    pub interfaces: Vec<Interface>,
}

#[derive(Debug, Clone, Default)]
pub struct Interface {
    pub name: String,
    pub methods: Vec<Method>,
    pub signals: Vec<SignalDescriptor>,
    pub properties: Vec<Property>,
}

/// A method descriptor with its argument signatures concatenated per
/// direction.
#[derive(Debug, Clone, Default)]
pub struct Method {
    pub name: String,
    pub in_signature: String,
    pub out_signature: String,
}

#[derive(Debug, Clone, Default)]
pub struct SignalDescriptor {
    pub name: String,
    pub signature: String,
}

#[derive(Debug, Clone, Default)]
pub struct Property {
    pub name: String,
    pub type_signature: String,
    pub access: String,
}

impl Node {
    /// The first interface carrying a method with this name, in document
    /// order.
    pub fn find_method(&self, member: &str) -> Option<(&Interface, &Method)> {
        self.interfaces.iter().find_map(|interface| {
            interface
                .methods
                .iter()
                .find(|method| method.name == member)
                .map(|method| (interface, method))
        })
    }

    /// The first interface carrying a property with this name, in document
    /// order.
    pub fn find_property(&self, name: &str) -> Option<(&Interface, &Property)> {
        self.interfaces.iter().find_map(|interface| {
            interface
                .properties
                .iter()
                .find(|property| property.name == name)
                .map(|property| (interface, property))
        })
    }
}

#[derive(Default)]
struct ChildNode {
    name: String,
}

#[derive(Default)]
struct Arg {
    type_signature: String,
    direction: Option<String>,
}

enum State {
    Node(Node),
    ChildNode(ChildNode),
    Interface(Interface),
    Method(Method),
    Signal(SignalDescriptor),
    Property(Property),
    Arg(Arg),
    Skip,
}

impl State {
    fn set_attribute(&mut self, name: &str, value: &str) {
        match self {
            State::ChildNode(child) if name == "name" => child.name = value.to_string(),
            State::Interface(interface) if name == "name" => interface.name = value.to_string(),
            State::Method(method) if name == "name" => method.name = value.to_string(),
            State::Signal(signal) if name == "name" => signal.name = value.to_string(),
            State::Property(property) => match name {
                "name" => property.name = value.to_string(),
                "type" => property.type_signature = value.to_string(),
                "access" => property.access = value.to_string(),
                _ => {}
            },
            State::Arg(arg) => match name {
                "type" => arg.type_signature = value.to_string(),
                "direction" => arg.direction = Some(value.to_string()),
                _ => {}
            },
            _ => {}
        }
    }
}

fn commit(state: State, stack: &mut Vec<State>, root: &mut Option<Node>) {
    match (state, stack.last_mut()) {
        (State::Node(node), None) => {
            if root.is_none() {
                *root = Some(node);
            }
        }
        (State::ChildNode(child), Some(State::Node(node))) => {
            if !child.name.is_empty() {
                node.children.push(child.name);
            }
        }
        (State::Interface(interface), Some(State::Node(node))) => node.interfaces.push(interface),
        (State::Method(method), Some(State::Interface(interface))) => {
            interface.methods.push(method)
        }
        (State::Signal(signal), Some(State::Interface(interface))) => {
            interface.signals.push(signal)
        }
        (State::Property(property), Some(State::Interface(interface))) => {
            interface.properties.push(property)
        }
        (State::Arg(arg), Some(State::Method(method))) => {
            // Method arguments default to "in".
            match arg.direction.as_deref() {
                Some("out") => method.out_signature.push_str(&arg.type_signature),
                _ => method.in_signature.push_str(&arg.type_signature),
            }
        }
        (State::Arg(arg), Some(State::Signal(signal))) => {
            signal.signature.push_str(&arg.type_signature)
        }
        _ => {}
    }
}

/// Parse the XML returned by `org.freedesktop.DBus.Introspectable.Introspect`.
pub fn parse_introspection_xml(xml: &str) -> crate::Result<Node> {
    let mut stack: Vec<State> = Vec::new();
    let mut root: Option<Node> = None;

    for token in Tokenizer::from(xml) {
        let token = token
            .map_err(|err| Error::Resolution(format!("bad introspection XML: {}", err)))?;

        match token {
            Token::ElementStart { local, .. } => {
                let state = match (stack.last(), local.as_str()) {
                    (None, "node") => State::Node(Node::default()),
                    (Some(State::Node(_)), "node") => State::ChildNode(ChildNode::default()),
                    (Some(State::Node(_)), "interface") => State::Interface(Interface::default()),
                    (Some(State::Interface(_)), "method") => State::Method(Method::default()),
                    (Some(State::Interface(_)), "signal") => {
                        State::Signal(SignalDescriptor::default())
                    }
                    (Some(State::Interface(_)), "property") => {
                        State::Property(Property::default())
                    }
                    (Some(State::Method(_)), "arg") | (Some(State::Signal(_)), "arg") => {
                        State::Arg(Arg::default())
                    }
                    _ => State::Skip,
                };
                stack.push(state);
            }
            Token::Attribute { local, value, .. } => {
                if let Some(state) = stack.last_mut() {
                    state.set_attribute(local.as_str(), value.as_str());
                }
            }
            Token::ElementEnd { end, .. } => match end {
                ElementEnd::Open => {}
                ElementEnd::Close(..) | ElementEnd::Empty => {
                    if let Some(state) = stack.pop() {
                        commit(state, &mut stack, &mut root);
                    }
                }
            },
            _ => {}
        }
    }

    root.ok_or_else(|| Error::Resolution("introspection XML carries no node element".into()))
}
