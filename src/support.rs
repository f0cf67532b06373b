use crate::Download;

/// Drains a download into an owned buffer.
///
/// Every upload source in this crate is materialized this way before being
/// written back out; feeding one network read straight into a network write
/// is how a rejected conditioned upload leaves partial state behind.
pub async fn drain_to_vec(mut download: Download) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    tokio::io::copy(&mut download.download_stream, &mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn drains_the_whole_stream() {
        let download = Download {
            download_stream: Box::pin(Cursor::new(b"Original content".to_vec())),
        };
        let buf = drain_to_vec(download).await.unwrap();
        assert_eq!(buf, b"Original content");
    }
}
