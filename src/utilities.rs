use base64::Engine;
use base64::engine::general_purpose;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};

// generate the auth header for the workspace APIs: the raw access token,
// base64 encoded with the Basic scheme (not a user:password pair)
pub fn get_header_with_basic_token(access_token: &str) -> HeaderMap<HeaderValue> {
    let encoded_token = general_purpose::STANDARD.encode(access_token.as_bytes());
    let mut headers = HeaderMap::new();
    let mut auth_header: HeaderValue = format!("Basic {encoded_token}")
        .parse()
        .expect("base64 output is always a valid header value");
    auth_header.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth_header);
    headers
}

pub async fn create_kube_client() -> Result<kube::Client, kube::Error> {
    match kube::Config::incluster() {
        Ok(kube_config) => {
            info!("using in-cluster kube config");
            kube::Client::try_from(kube_config)
        }
        Err(err) => {
            info!("no in-cluster config found ({}), falling back to kube config", err);
            kube::Client::try_default().await
        }
    }
}

#[cfg(test)]
mod tests_utilities {
    use super::get_header_with_basic_token;
    use reqwest::header::AUTHORIZATION;

    #[test]
    fn test_basic_token_header() {
        let headers = get_header_with_basic_token("yio2P5qX5exUyX4bG1P-T7");
        let value = headers.get(AUTHORIZATION).expect("header must be set");
        // raw token encoded, no colon inserted
        assert_eq!(value.as_bytes(), b"Basic eWlvMlA1cVg1ZXhVeVg0YkcxUC1UNw==");
        assert!(value.is_sensitive());
    }
}
