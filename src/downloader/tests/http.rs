use super::*;
use futures::StreamExt;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(url: String, begin: u64, end: Option<u64>) -> ChunkRequest {
    ChunkRequest {
        file: EntityId(1),
        url,
        begin,
        end,
        account: Account::new("anon", "*", 4),
    }
}

async fn collect(response: ChunkResponse) -> Vec<u8> {
    let mut stream = response.stream;
    let mut out = Vec::new();
    while let Some(block) = stream.next().await {
        out.extend(block.unwrap());
    }
    out
}

#[tokio::test]
async fn test_partial_content_is_streamed() {
    let server = MockServer::start().await;
    let data = body(1_000);
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .and(header("Range", "bytes=100-199"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 100-199/1000")
                .set_body_bytes(data[100..200].to_vec()),
        )
        .mount(&server)
        .await;

    let hoster = HttpHoster::new().unwrap();
    let url = format!("{}/data.bin", server.uri());
    let response = hoster
        .open_first(&request(url, 100, Some(200)))
        .await
        .unwrap();

    assert_eq!(response.size, Some(1_000));
    assert_eq!(response.can_resume, Some(true));
    assert_eq!(collect(response).await, data[100..200].to_vec());
}

#[tokio::test]
async fn test_ignored_range_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body(1_000)))
        .mount(&server)
        .await;

    let hoster = HttpHoster::new().unwrap();
    let url = format!("{}/data.bin", server.uri());
    let result = hoster.open_first(&request(url, 500, None)).await;

    assert!(matches!(result, Err(HosterError::RangeRejected)));
}

#[tokio::test]
async fn test_missing_file_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone.bin"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let hoster = HttpHoster::new().unwrap();
    let url = format!("{}/gone.bin", server.uri());
    let result = hoster.open_first(&request(url, 0, None)).await;

    assert!(matches!(result, Err(HosterError::Fatal(_))));
}

#[tokio::test]
async fn test_server_error_is_retryable_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let hoster = HttpHoster::new().unwrap();
    let url = format!("{}/data.bin", server.uri());
    let result = hoster.open_first(&request(url, 0, None)).await;

    assert!(matches!(result, Err(HosterError::Status(503))));
}

#[tokio::test]
async fn test_check_falls_back_to_get() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/download"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Disposition", "attachment; filename=\"movie.mkv\"")
                .set_body_bytes(body(1_000)),
        )
        .mount(&server)
        .await;

    let hoster = HttpHoster::new().unwrap();
    let info = hoster
        .check(&format!("{}/download", server.uri()))
        .await
        .unwrap();

    assert_eq!(info.name.as_deref(), Some("movie.mkv"));
    assert_eq!(info.size, Some(1_000));
    assert!(!info.size_is_approximate);
}
