use std::convert::Infallible;
use std::error::Error;
use std::str::Utf8Error;

/// Turns the raw body of an [`IncomingMessage`](crate::IncomingMessage) into
/// a typed value, via [`IncomingMessage::decode`](crate::IncomingMessage::decode).
///
/// The output is owned: it may not borrow from the body. Where borrowing is
/// needed, read the [raw body](crate::IncomingMessage::body) instead.
pub trait Decoder {
    /// The decoded value.
    type Output;

    /// The failure to decode. Surfaces as
    /// [`Error::Deserialization`](crate::Error::Deserialization).
    type Error: Error;

    /// Decodes the given body.
    fn decode(&self, body: &[u8]) -> Result<Self::Output, Self::Error>;
}

/// Any function or closure from a body to an owned result is a [`Decoder`].
impl<F, O, E> Decoder for F
where
    F: Fn(&[u8]) -> Result<O, E>,
    E: Error,
{
    type Output = O;
    type Error = E;

    fn decode(&self, body: &[u8]) -> Result<Self::Output, Self::Error> {
        self(body)
    }
}

/// Ignores the body.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDecoder;

impl Decoder for NoopDecoder {
    type Output = ();
    type Error = Infallible;

    fn decode(&self, _body: &[u8]) -> Result<Self::Output, Self::Error> {
        Ok(())
    }
}

/// Copies a UTF-8 body into a [`String`]. Fails on invalid UTF-8 without
/// copying anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringDecoder;

impl Decoder for StringDecoder {
    type Output = String;
    type Error = Utf8Error;

    fn decode(&self, body: &[u8]) -> Result<Self::Output, Self::Error> {
        std::str::from_utf8(body).map(str::to_owned)
    }
}

/// Parses a JSON body into `T`.
#[cfg(feature = "json")]
pub struct JsonDecoder<T>(std::marker::PhantomData<fn() -> T>);

#[cfg(feature = "json")]
impl<T> JsonDecoder<T> {
    /// Creates a decoder into `T`.
    pub fn new() -> Self {
        Self(std::marker::PhantomData)
    }
}

#[cfg(feature = "json")]
impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "json")]
impl<T> Decoder for JsonDecoder<T>
where
    T: serde::de::DeserializeOwned,
{
    type Output = T;
    type Error = serde_json::Error;

    fn decode(&self, body: &[u8]) -> Result<Self::Output, Self::Error> {
        serde_json::from_slice(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::num::ParseIntError;

    #[test]
    fn string_decoder() {
        assert_eq!(StringDecoder.decode(b"hello").unwrap(), "hello");
        assert!(StringDecoder.decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn closure_decoder() {
        // Given
        let decoder = |body: &[u8]| -> Result<u32, ParseIntError> {
            String::from_utf8_lossy(body).trim().parse()
        };

        // Then
        assert_eq!(decoder.decode(b" 42 ").unwrap(), 42);
        assert!(decoder.decode(b"many").is_err());
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_decoder() {
        // Given
        let decoder = JsonDecoder::<Vec<u8>>::new();

        // Then
        assert_eq!(decoder.decode(b"[1, 2]").unwrap(), vec![1, 2]);
        assert!(decoder.decode(b"{").is_err());
    }
}
