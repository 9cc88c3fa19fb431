//! Positional JSON-RPC parameters.
//!
//! Byte strings travel as base64, ids as base58 and list orders as the
//! numbers clients already send (`1` previous, `2` next). Trailing params may
//! be omitted; an empty string counts as omitted too.
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::de::DeserializeOwned;
use serde_json::Value;

use ptt_protocol::PttID;

use super::{Result, RpcError};

pub const LIST_ORDER_PREV: u8 = 1;
pub const LIST_ORDER_NEXT: u8 = 2;

#[derive(Debug, Default, Clone)]
pub struct Params(Vec<Value>);

impl Params {
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Params::default()),
            Value::Array(values) => Ok(Params(values)),
            _ => Err(RpcError::BadParams("params must be an array".into())),
        }
    }

    pub fn new(values: Vec<Value>) -> Self {
        Params(values)
    }

    fn get(&self, i: usize) -> Option<&Value> {
        match self.0.get(i) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(v) => Some(v),
        }
    }

    fn parse<T: DeserializeOwned>(&self, i: usize, v: &Value) -> Result<T> {
        serde_json::from_value(v.clone()).map_err(|e| RpcError::BadParams(format!("param {i}: {e}")))
    }

    pub fn opt<T: DeserializeOwned>(&self, i: usize) -> Result<Option<T>> {
        self.get(i).map(|v| self.parse(i, v)).transpose()
    }

    pub fn req<T: DeserializeOwned>(&self, i: usize) -> Result<T> {
        self.opt(i)?
            .ok_or_else(|| RpcError::BadParams(format!("param {i} is required")))
    }

    pub fn or<T: DeserializeOwned>(&self, i: usize, default: T) -> Result<T> {
        Ok(self.opt(i)?.unwrap_or(default))
    }

    pub fn id(&self, i: usize) -> Result<PttID> {
        let text: String = self.req(i)?;
        PttID::from_base58(&text).map_err(|e| RpcError::BadParams(format!("param {i}: {e}")))
    }

    pub fn opt_id(&self, i: usize) -> Result<Option<PttID>> {
        match self.opt::<String>(i)? {
            Some(text) => PttID::from_base58(&text)
                .map(Some)
                .map_err(|e| RpcError::BadParams(format!("param {i}: {e}"))),
            None => Ok(None),
        }
    }

    pub fn ids(&self, i: usize) -> Result<Vec<PttID>> {
        self.or::<Vec<String>>(i, Vec::new())?
            .iter()
            .map(|s| PttID::from_base58(s).map_err(|e| RpcError::BadParams(format!("param {i}: {e}"))))
            .collect()
    }

    pub fn bytes(&self, i: usize) -> Result<Vec<u8>> {
        let text: String = self.req(i)?;
        decode_base64(i, &text)
    }

    pub fn lines(&self, i: usize) -> Result<Vec<Vec<u8>>> {
        self.req::<Vec<String>>(i)?
            .iter()
            .map(|s| decode_base64(i, s))
            .collect()
    }

    /// `true` when the list order asks for newest first.
    pub fn descending(&self, i: usize) -> Result<bool> {
        Ok(self.or::<u8>(i, LIST_ORDER_NEXT)? == LIST_ORDER_PREV)
    }
}

fn decode_base64(i: usize, text: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(text)
        .map_err(|e| RpcError::BadParams(format!("param {i}: {e}")))
}

pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Window of `items` starting at `start`, `limit` long (0 = all).
pub fn page<T>(mut items: Vec<T>, start: Option<PttID>, limit: usize, descending: bool, id_of: impl Fn(&T) -> PttID) -> Vec<T> {
    if descending {
        items.reverse();
    }
    let skip = start
        .and_then(|start| items.iter().position(|item| id_of(item) == start))
        .unwrap_or(0);
    let limit = if limit == 0 { usize::MAX } else { limit };
    items.into_iter().skip(skip).take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_and_empty_are_omitted() {
        let params = Params::new(vec![json!(""), json!(null)]);
        assert_eq!(params.opt_id(0).unwrap(), None);
        assert_eq!(params.or::<usize>(1, 5).unwrap(), 5);
        assert_eq!(params.or::<usize>(9, 3).unwrap(), 3);
        assert!(params.id(0).is_err());
    }

    #[test]
    fn test_bytes_are_base64() {
        let params = Params::new(vec![json!("aGk="), json!(["YQ==", "Yg=="]), json!("!!")]);
        assert_eq!(params.bytes(0).unwrap(), b"hi");
        assert_eq!(params.lines(1).unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(matches!(params.bytes(2), Err(RpcError::BadParams(_))));
    }

    #[test]
    fn test_object_params_rejected() {
        assert!(Params::from_value(json!({"a": 1})).is_err());
        assert!(Params::from_value(Value::Null).is_ok());
    }

    #[test]
    fn test_page() {
        let ids: Vec<PttID> = (0..5).map(|_| PttID::random()).collect();
        let got = page(ids.clone(), Some(ids[1]), 2, false, |id| *id);
        assert_eq!(got, vec![ids[1], ids[2]]);
        let got = page(ids.clone(), None, 0, true, |id| *id);
        assert_eq!(got.first(), ids.last());
        assert_eq!(page(ids.clone(), Some(PttID::random()), 1, false, |id| *id), vec![ids[0]]);
    }
}
