use crate::type_system::signature::Signature;
use crate::type_system::types::{DBusSignature, Type};

#[derive(Debug, Clone, Default)]
pub struct Body {
    pub arguments: Vec<Type>,

    /// When set, this signature is emitted in the header field instead of
    /// the one derived from the arguments. Lets a caller-supplied signature
    /// travel to the peer as-is, mismatched or not.
    pub signature_override: Option<DBusSignature>,
}

impl Body {
    pub fn new(arguments: Vec<Type>) -> Self {
        Self {
            arguments,
            signature_override: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }

    /// The body is made up of zero or more single complete types.
    pub fn signature(&self) -> DBusSignature {
        match &self.signature_override {
            Some(signature) => signature.clone(),
            None => DBusSignature {
                vec: self.arguments.iter().map(|arg| arg.signature()).collect(),
            },
        }
    }
}
