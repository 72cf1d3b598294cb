//! Byte-stream combinators used to assemble composite responses without
//! buffering whole documents: `concat` yields from one inner stream at a
//! time, `wrap_text` brackets a stream with prefix/suffix text, and
//! `transform` maps chunks in flight.

use std::io;
use std::pin::Pin;

use async_stream::stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};

/// The byte stream shape flowing through the gateway.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

/// A single-chunk stream from owned text.
pub fn once_text(text: String) -> ByteStream {
    Box::pin(futures::stream::once(async move { Ok(Bytes::from(text)) }))
}

/// An empty stream.
pub fn empty() -> ByteStream {
    Box::pin(futures::stream::empty())
}

/// Concatenates streams in order, draining one inner stream completely
/// before starting the next. Errors pass through and end the stream.
pub fn concat(streams: Vec<ByteStream>) -> ByteStream {
    Box::pin(stream! {
        for mut inner in streams {
            while let Some(chunk) = inner.next().await {
                let failed = chunk.is_err();
                yield chunk;
                if failed {
                    return;
                }
            }
        }
    })
}

/// Brackets `inner` with literal text on both sides.
pub fn wrap_text(prefix: String, inner: ByteStream, suffix: String) -> ByteStream {
    concat(vec![once_text(prefix), inner, once_text(suffix)])
}

/// Applies `f` to every chunk.
pub fn transform<F>(inner: ByteStream, mut f: F) -> ByteStream
where
    F: FnMut(Bytes) -> Bytes + Send + 'static,
{
    Box::pin(stream! {
        let mut inner = inner;
        while let Some(chunk) = inner.next().await {
            yield chunk.map(&mut f);
        }
    })
}

/// Pulls chunks until the first non-empty one, then hands back a stream with
/// that chunk re-attached. `Ok(None)` means the stream ended empty.
pub async fn peek_nonempty(mut inner: ByteStream) -> io::Result<Option<ByteStream>> {
    loop {
        match inner.next().await {
            None => return Ok(None),
            Some(Err(err)) => return Err(err),
            Some(Ok(chunk)) if chunk.is_empty() => continue,
            Some(Ok(chunk)) => {
                let head: ByteStream =
                    Box::pin(futures::stream::once(async move { Ok(chunk) }));
                return Ok(Some(concat(vec![head, inner])));
            }
        }
    }
}

/// Collects a whole stream into one buffer. Test and SSR-error helper.
pub async fn collect(mut stream: ByteStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn chunks(parts: &[&str]) -> ByteStream {
        let owned: Vec<io::Result<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        Box::pin(futures::stream::iter(owned))
    }

    #[tokio::test]
    async fn concat_preserves_order_across_streams() {
        let combined = concat(vec![chunks(&["a", "b"]), chunks(&[]), chunks(&["c"])]);
        assert_eq!(collect(combined).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn wrap_text_brackets_the_inner_stream() {
        let wrapped = wrap_text("<x>".into(), chunks(&["mid"]), "</x>".into());
        assert_eq!(collect(wrapped).await.unwrap(), b"<x>mid</x>");
    }

    #[tokio::test]
    async fn transform_maps_each_chunk() {
        let upper = transform(chunks(&["ab", "cd"]), |chunk| {
            Bytes::from(chunk.to_ascii_uppercase())
        });
        assert_eq!(collect(upper).await.unwrap(), b"ABCD");
    }

    #[tokio::test]
    async fn peek_detects_empty_and_restores_content() {
        assert!(peek_nonempty(chunks(&[])).await.unwrap().is_none());
        assert!(peek_nonempty(chunks(&["", ""])).await.unwrap().is_none());

        let restored = peek_nonempty(chunks(&["", "first", "second"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(collect(restored).await.unwrap(), b"firstsecond");
    }

    #[tokio::test]
    async fn errors_end_the_concatenation() {
        let failing: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"ok")),
            Err(io::Error::new(io::ErrorKind::Other, "upstream died")),
        ]));
        let combined = concat(vec![failing, chunks(&["never"])]);
        assert!(collect(combined).await.is_err());
    }
}
