//! The client layer: method calls with introspection-driven inference,
//! property access, signal streams, and the desktop-portal request pattern.

pub mod introspect;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use smol::stream::Stream;

use crate::connection::{
    lock, Connection, SignalFilter, SignalMessage, DBUS_INTERFACE, DBUS_PATH, DBUS_SERVICE,
};
use crate::message_protocol::body::Body;
use crate::message_protocol::MethodCall;
use crate::type_system::signature::{parse_signature, Signature};
use crate::type_system::types::*;
use crate::Error;

use self::introspect::Node;

const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
const PORTAL_REQUEST_INTERFACE: &str = "org.freedesktop.portal.Request";

/// Which bus to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
    /// An explicit address in the D-Bus address grammar.
    Address(String),
}

/// Open a connection to the chosen bus and wrap it in a [Client].
pub async fn get_client(kind: BusKind) -> crate::Result<Client> {
    let connection = match kind {
        BusKind::Session => Connection::session().await?,
        BusKind::System => Connection::system().await?,
        BusKind::Address(address) => {
            Connection::open(&crate::Address::parse(&address)?).await?
        }
    };
    Ok(Client::new(connection))
}

/// A bus client. Dropping it (or calling [Client::close]) tears down the
/// underlying connection: outstanding calls fail and signal streams end.
pub struct Client {
    connection: Connection,
    /// (destination, path) → introspected node. Read-through, never
    /// invalidated for the lifetime of the connection.
    cache: Arc<Mutex<HashMap<(String, String), Arc<Node>>>>,
}

impl Client {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }

    /// Call `member` on `destination` and return the reply body.
    ///
    /// Omitted pieces are resolved through introspection: the path and
    /// interface by a depth-first walk from `/` where the first node whose
    /// interfaces carry `member` wins, and the signature from the method's
    /// input arguments. First-match-wins is inherently brittle when a name
    /// occurs more than once; passing explicit arguments is the reliable
    /// path. A caller-supplied signature is sent as-is, even when it does
    /// not match the arguments; the peer will answer with an error.
    pub async fn call(
        &self,
        destination: &str,
        path: Option<&str>,
        interface: Option<&str>,
        member: &str,
        arguments: Vec<Type>,
        signature: Option<&str>,
    ) -> crate::Result<Vec<Type>> {
        let needs_signature = signature.is_none() && !arguments.is_empty();
        let (path, interface, inferred) = match (path, interface) {
            (Some(path), Some(interface)) if !needs_signature => {
                (path.to_string(), interface.to_string(), None)
            }
            (path, interface) => {
                self.resolve_method(destination, path, interface, member)
                    .await?
            }
        };

        let mut body = Body::new(arguments);
        body.signature_override = match signature {
            Some(signature) => Some(DBusSignature {
                vec: parse_signature(signature)?,
            }),
            None => inferred,
        };

        let reply = self
            .connection
            .call(MethodCall::new(
                destination,
                path,
                Some(DBusString::new(interface)),
                member,
                body,
            ))
            .await?;
        Ok(reply.body.arguments)
    }

    /// `org.freedesktop.DBus.Properties.Get` with the same inference as
    /// [Client::call]. Returns the value inside the reply variant.
    pub async fn get_property(
        &self,
        destination: &str,
        path: Option<&str>,
        interface: Option<&str>,
        name: &str,
    ) -> crate::Result<Type> {
        let (path, interface) = self
            .resolve_property(destination, path, interface, name)
            .await?;

        let reply = self
            .connection
            .call(MethodCall::new(
                destination,
                path,
                Some(DBusString::new(PROPERTIES_INTERFACE)),
                "Get",
                Body::new(vec![
                    DBusString::new(interface).into(),
                    DBusString::new(name).into(),
                ]),
            ))
            .await?;

        match reply.body.arguments.into_iter().next() {
            Some(Type::Container(ContainerType::DBusVariant(variant))) => Ok(*variant.variant),
            _ => Err(Error::Resolution(format!(
                "Get for {:?} did not return a variant",
                name
            ))),
        }
    }

    /// `org.freedesktop.DBus.Properties.Set` with the same inference as
    /// [Client::call]. The value is wrapped in a variant carrying its own
    /// signature.
    pub async fn set_property(
        &self,
        destination: &str,
        path: Option<&str>,
        interface: Option<&str>,
        name: &str,
        value: Type,
    ) -> crate::Result<()> {
        let (path, interface) = self
            .resolve_property(destination, path, interface, name)
            .await?;

        self.connection
            .call(MethodCall::new(
                destination,
                path,
                Some(DBusString::new(PROPERTIES_INTERFACE)),
                "Set",
                Body::new(vec![
                    DBusString::new(interface).into(),
                    DBusString::new(name).into(),
                    DBusVariant::new(value).into(),
                ]),
            ))
            .await?;
        Ok(())
    }

    /// Subscribe to signals matching the given fields. A match rule is
    /// registered with the bus; the returned stream yields signals until it
    /// is dropped, which unregisters the rule again.
    pub async fn subscribe_signal(
        &self,
        sender: Option<&str>,
        path: Option<&str>,
        interface: Option<&str>,
        member: &str,
    ) -> crate::Result<SignalStream> {
        let filter = SignalFilter {
            // Signals arrive stamped with the emitter's unique name. A
            // well-known name would never compare equal, so it is left to
            // the bus-side rule alone.
            sender: sender
                .filter(|sender| sender.starts_with(':'))
                .map(str::to_string),
            path: path.map(str::to_string),
            interface: interface.map(str::to_string),
            member: Some(member.to_string()),
        };
        let rule = match_rule(sender, path, interface, Some(member));
        self.subscribe_with(filter, rule).await
    }

    /// Issue a portal-style request: the reply names a request handle
    /// object, which later emits a `Response` signal carrying the actual
    /// results.
    ///
    /// The handle path is predicted from our unique name and the
    /// `handle_token` entry of the trailing options dict, and the `Response`
    /// subscription is installed before the call so the signal cannot be
    /// missed. Responses: 0 yields the results, 1 means the user cancelled,
    /// anything else is a failure; both surface as [Error::Portal].
    pub async fn portal_call(
        &self,
        destination: &str,
        path: Option<&str>,
        interface: Option<&str>,
        member: &str,
        arguments: Vec<Type>,
    ) -> crate::Result<Vec<(String, Type)>> {
        let handle_token = arguments
            .last()
            .and_then(extract_handle_token)
            .ok_or_else(|| {
                Error::Resolution("portal options carry no handle_token".into())
            })?;
        let unique_name = self.connection.unique_name().ok_or(Error::Disconnected)?;
        let predicted = request_handle_path(&unique_name, &handle_token);

        let mut stream = self.subscribe_response(&predicted).await?;

        // Portal options are open dicts, so the signature derived from the
        // values is already the right one; passing it explicitly skips the
        // introspection round-trip.
        let signature: String = arguments
            .iter()
            .map(|argument| argument.signature().serialize())
            .collect();
        let reply = self
            .call(
                destination,
                path,
                interface,
                member,
                arguments,
                Some(&signature),
            )
            .await?;

        let handle = reply
            .get(0)
            .and_then(Type::as_object_path)
            .ok_or_else(|| {
                Error::Resolution("portal reply carried no request handle".into())
            })?;
        if handle != predicted {
            // Older portal backends derive the handle differently; follow
            // the path the reply names. Subscribe to the new path before
            // dropping the old stream so its RemoveMatch cannot overtake.
            let replaced =
                std::mem::replace(&mut stream, self.subscribe_response(handle).await?);
            drop(replaced);
        }

        let signal = stream.next().await.ok_or(Error::Cancelled)?;
        let code = signal
            .body
            .get(0)
            .and_then(Type::as_u32)
            .ok_or_else(|| Error::Resolution("malformed portal response".into()))?;
        let results = signal
            .body
            .get(1)
            .and_then(Type::as_string_dict)
            .map(|entries| {
                entries
                    .into_iter()
                    .map(|(key, value)| {
                        (
                            key.to_string(),
                            value.as_variant().unwrap_or(value).clone(),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        if code == 0 {
            Ok(results)
        } else {
            Err(Error::Portal { code, results })
        }
    }

    /// Introspect one object, read-through against the per-connection
    /// cache.
    pub async fn introspect(&self, destination: &str, path: &str) -> crate::Result<Arc<Node>> {
        let key = (destination.to_string(), path.to_string());
        if let Some(node) = lock(&self.cache).get(&key) {
            return Ok(node.clone());
        }

        let reply = self
            .connection
            .call(MethodCall::new(
                destination,
                path,
                Some(DBusString::new(INTROSPECTABLE_INTERFACE)),
                "Introspect",
                Body::default(),
            ))
            .await?;
        let xml = reply
            .body
            .arguments
            .get(0)
            .and_then(Type::as_str)
            .ok_or_else(|| Error::Resolution("Introspect returned no XML".into()))?;

        let node = Arc::new(introspect::parse_introspection_xml(xml)?);
        lock(&self.cache).insert(key, node.clone());
        Ok(node)
    }

    async fn subscribe_with(
        &self,
        filter: SignalFilter,
        rule: String,
    ) -> crate::Result<SignalStream> {
        // The local queue goes in first so nothing slips between AddMatch
        // taking effect and us listening.
        let handle = self.connection.subscribe(filter)?;

        let added = self
            .connection
            .call(MethodCall::new(
                DBUS_SERVICE,
                DBUS_PATH,
                Some(DBusString::new(DBUS_INTERFACE)),
                "AddMatch",
                Body::new(vec![DBusString::new(rule.as_str()).into()]),
            ))
            .await;
        if let Err(err) = added {
            self.connection.unsubscribe(handle.id);
            return Err(err);
        }

        Ok(SignalStream {
            connection: self.connection.clone(),
            receiver: handle.receiver,
            overflowed: handle.overflowed,
            id: handle.id,
            rule,
        })
    }

    async fn subscribe_response(&self, handle_path: &str) -> crate::Result<SignalStream> {
        let filter = SignalFilter {
            sender: None,
            path: Some(handle_path.to_string()),
            interface: Some(PORTAL_REQUEST_INTERFACE.to_string()),
            member: Some("Response".to_string()),
        };
        let rule = match_rule(
            None,
            Some(handle_path),
            Some(PORTAL_REQUEST_INTERFACE),
            Some("Response"),
        );
        self.subscribe_with(filter, rule).await
    }

    /// Locate `member`, returning (path, interface, input signature).
    async fn resolve_method(
        &self,
        destination: &str,
        path: Option<&str>,
        interface: Option<&str>,
        member: &str,
    ) -> crate::Result<(String, String, Option<DBusSignature>)> {
        let not_found = || {
            Error::Resolution(format!(
                "member {:?} not found on {:?}",
                member, destination
            ))
        };

        if let Some(path) = path {
            let node = self.introspect(destination, path).await?;
            let (found_interface, method) = match interface {
                Some(interface) => node
                    .interfaces
                    .iter()
                    .find(|candidate| candidate.name == interface)
                    .and_then(|candidate| {
                        candidate
                            .methods
                            .iter()
                            .find(|method| method.name == member)
                            .map(|method| (candidate, method))
                    })
                    .ok_or_else(not_found)?,
                None => node.find_method(member).ok_or_else(not_found)?,
            };
            let signature = parse_method_signature(destination, method)?;
            return Ok((path.to_string(), found_interface.name.clone(), signature));
        }

        let found = self
            .walk_tree(destination, |node_path, node| {
                let hit = match interface {
                    Some(interface) => node
                        .interfaces
                        .iter()
                        .find(|candidate| candidate.name == interface)
                        .and_then(|candidate| {
                            candidate
                                .methods
                                .iter()
                                .find(|method| method.name == member)
                                .map(|method| (candidate, method))
                        }),
                    None => node.find_method(member),
                };
                hit.map(|(found_interface, method)| {
                    (
                        node_path.to_string(),
                        found_interface.name.clone(),
                        method.clone(),
                    )
                })
            })
            .await?;

        let (path, interface, method) = found.ok_or_else(not_found)?;
        let signature = parse_method_signature(destination, &method)?;
        Ok((path, interface, signature))
    }

    /// Locate a property, returning (path, interface).
    async fn resolve_property(
        &self,
        destination: &str,
        path: Option<&str>,
        interface: Option<&str>,
        name: &str,
    ) -> crate::Result<(String, String)> {
        let not_found = || {
            Error::Resolution(format!(
                "property {:?} not found on {:?}",
                name, destination
            ))
        };

        match (path, interface) {
            (Some(path), Some(interface)) => Ok((path.to_string(), interface.to_string())),
            (Some(path), None) => {
                let node = self.introspect(destination, path).await?;
                let (found_interface, _) = node.find_property(name).ok_or_else(not_found)?;
                Ok((path.to_string(), found_interface.name.clone()))
            }
            (None, interface) => {
                let found = self
                    .walk_tree(destination, |node_path, node| {
                        let hit = match interface {
                            Some(interface) => node
                                .interfaces
                                .iter()
                                .find(|candidate| candidate.name == interface)
                                .and_then(|candidate| {
                                    candidate
                                        .properties
                                        .iter()
                                        .find(|property| property.name == name)
                                        .map(|property| (candidate, property))
                                }),
                            None => node.find_property(name),
                        };
                        hit.map(|(found_interface, _)| {
                            (node_path.to_string(), found_interface.name.clone())
                        })
                    })
                    .await?;
                found.ok_or_else(not_found)
            }
        }
    }

    /// Depth-first walk of the destination's introspection tree starting at
    /// `/`. The first node `visit` accepts wins; ties break by traversal
    /// order.
    async fn walk_tree<T, F>(&self, destination: &str, mut visit: F) -> crate::Result<Option<T>>
    where
        F: FnMut(&str, &Node) -> Option<T>,
    {
        let mut stack = vec!["/".to_string()];
        while let Some(path) = stack.pop() {
            let node = self.introspect(destination, &path).await?;
            if let Some(found) = visit(&path, &node) {
                return Ok(Some(found));
            }
            // Reversed push keeps document order under the pop-from-the-end
            // traversal.
            for child in node.children.iter().rev() {
                stack.push(join_path(&path, child));
            }
        }
        Ok(None)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.connection.close_now();
    }
}

/// A stream of signals matching one subscription. Single consumer; dropping
/// it detaches the subscription and unregisters the bus-side match rule.
pub struct SignalStream {
    connection: Connection,
    receiver: smol::channel::Receiver<SignalMessage>,
    overflowed: Arc<AtomicBool>,
    id: u64,
    rule: String,
}

impl SignalStream {
    /// The next matching signal, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<SignalMessage> {
        self.receiver.recv().await.ok()
    }

    /// Whether this subscription has dropped signals because the consumer
    /// fell behind.
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Relaxed)
    }
}

impl Stream for SignalStream {
    type Item = SignalMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().receiver).poll_next(cx)
    }
}

impl Drop for SignalStream {
    fn drop(&mut self) {
        self.connection.unsubscribe(self.id);

        // Unregistering the rule needs a round on the wire, which a drop
        // cannot await; a stale rule on a closed connection is harmless.
        let connection = self.connection.clone();
        let rule = std::mem::take(&mut self.rule);
        smol::spawn(async move {
            let _ = connection
                .call_no_reply(MethodCall::new(
                    DBUS_SERVICE,
                    DBUS_PATH,
                    Some(DBusString::new(DBUS_INTERFACE)),
                    "RemoveMatch",
                    Body::new(vec![DBusString::new(rule).into()]),
                ))
                .await;
        })
        .detach();
    }
}

fn parse_method_signature(
    destination: &str,
    method: &introspect::Method,
) -> crate::Result<Option<DBusSignature>> {
    let parsed = parse_signature(&method.in_signature).map_err(|_| {
        Error::Resolution(format!(
            "method {:?} on {:?} declares a malformed signature {:?}",
            method.name, destination, method.in_signature
        ))
    })?;
    Ok(Some(DBusSignature { vec: parsed }))
}

fn match_rule(
    sender: Option<&str>,
    path: Option<&str>,
    interface: Option<&str>,
    member: Option<&str>,
) -> String {
    let mut parts = vec!["type='signal'".to_string()];
    if let Some(sender) = sender {
        parts.push(format!("sender='{}'", sender));
    }
    if let Some(path) = path {
        parts.push(format!("path='{}'", path));
    }
    if let Some(interface) = interface {
        parts.push(format!("interface='{}'", interface));
    }
    if let Some(member) = member {
        parts.push(format!("member='{}'", member));
    }
    parts.join(",")
}

fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// The portal request handle path: the unique name with its colon dropped
/// and dots flattened, then the caller's handle token.
fn request_handle_path(unique_name: &str, handle_token: &str) -> String {
    let escaped = unique_name.trim_start_matches(':').replace('.', "_");
    format!(
        "/org/freedesktop/portal/desktop/request/{}/{}",
        escaped, handle_token
    )
}

fn extract_handle_token(options: &Type) -> Option<String> {
    for (key, value) in options.as_string_dict()? {
        if key == "handle_token" {
            let value = value.as_variant().unwrap_or(value);
            return value.as_str().map(str::to_string);
        }
    }
    None
}
