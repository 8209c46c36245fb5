//! TMDB API client and payload normalization
//!
//! The client owns its token bucket: every fetch waits for a slot, so
//! callers cannot exceed the configured request rate no matter how many
//! candidates they loop over.

use crate::config::{TmdbConfig, TmdbLimits};
use crate::error::{Error, Result};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::Client;
use serde_json::Value;
use std::num::NonZeroU32;
use std::time::Duration;

/// Normalized enrichment values extracted from one TMDB payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TmdbValues {
    pub title: Option<String>,
    pub aka: Option<String>,
    pub keywords: Option<String>,
    pub actors: Option<String>,
    pub directors: Option<String>,
    pub plot: Option<String>,
    pub genre: Option<String>,
    pub release_year: Option<i32>,
    pub poster_path: Option<String>,
}

pub struct TmdbClient {
    client: Client,
    base_url: String,
    api_key: String,
    language: String,
    limits: TmdbLimits,
    limiter: DefaultDirectRateLimiter,
}

impl TmdbClient {
    pub fn new(config: &TmdbConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_seconds))
            .build()?;
        let rate = NonZeroU32::new(config.rate_per_second).unwrap_or(nonzero!(1u32));
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            language: config.language.clone(),
            limits: config.limits.clone(),
            limiter: RateLimiter::direct(Quota::per_second(rate)),
        })
    }

    /// Fetch one title with credits, keywords and alternative titles
    /// appended, and normalize it for the enrichment table. Blocks on
    /// the token bucket before the request goes out.
    pub async fn fetch(&self, content_type: &str, tmdb_id: &str) -> Result<TmdbValues> {
        self.limiter.until_ready().await;
        let tmdb_type = match content_type {
            "movie" => "movie",
            "tv_show" | "tv" => "tv",
            other => {
                return Err(Error::Enrichment(format!(
                    "unsupported TMDB content type: {}",
                    other
                )));
            }
        };
        let url = format!("{}/{}/{}", self.base_url, tmdb_type, tmdb_id);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("api_key", self.api_key.as_str()),
                ("language", self.language.as_str()),
                (
                    "append_to_response",
                    "credits,keywords,alternative_titles",
                ),
            ])
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Enrichment(e.to_string()))?;
        let payload: Value = response.json().await?;
        Ok(normalize_payload(&payload, &self.limits))
    }
}

/// Flatten the raw TMDB response into the enrichment columns, applying
/// the configured list limits.
pub fn normalize_payload(payload: &Value, limits: &TmdbLimits) -> TmdbValues {
    let title = payload
        .get("title")
        .or_else(|| payload.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let genre = join_names(payload.get("genres"), usize::MAX);

    let keywords_obj = payload.get("keywords");
    let keywords = keywords_obj
        .and_then(|k| k.get("keywords").or_else(|| k.get("results")))
        .and_then(|list| join_names(Some(list), usize::MAX));

    let credits = payload.get("credits");
    let actors = credits
        .and_then(|c| c.get("cast"))
        .and_then(|cast| join_names(Some(cast), limits.actors));
    let directors = credits
        .and_then(|c| c.get("crew"))
        .and_then(Value::as_array)
        .map(|crew| {
            crew.iter()
                .filter(|m| m.get("job").and_then(Value::as_str) == Some("Director"))
                .filter_map(|m| m.get("name").and_then(Value::as_str))
                .take(limits.directors)
                .collect::<Vec<_>>()
                .join(", ")
        })
        .filter(|s| !s.is_empty());

    let alt_titles = payload.get("alternative_titles");
    let aka = alt_titles
        .and_then(|a| a.get("titles").or_else(|| a.get("results")))
        .and_then(Value::as_array)
        .map(|titles| {
            titles
                .iter()
                .filter_map(|t| t.get("title").and_then(Value::as_str))
                .filter(|t| !t.is_empty())
                .take(limits.aka)
                .collect::<Vec<_>>()
                .join(", ")
        })
        .filter(|s| !s.is_empty());

    let plot = payload
        .get("overview")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let release_year = payload
        .get("release_date")
        .or_else(|| payload.get("first_air_date"))
        .and_then(Value::as_str)
        .and_then(|d| d.split('-').next())
        .and_then(|y| y.parse::<i32>().ok());

    let poster_path = payload
        .get("poster_path")
        .and_then(Value::as_str)
        .map(str::to_string);

    TmdbValues {
        title,
        aka,
        keywords,
        actors,
        directors,
        plot,
        genre,
        release_year,
        poster_path,
    }
}

/// Join the `name` field of a list of objects, capped at `limit`.
fn join_names(value: Option<&Value>, limit: usize) -> Option<String> {
    let items = value?.as_array()?;
    let joined = items
        .iter()
        .filter_map(|item| item.get("name").and_then(Value::as_str))
        .filter(|name| !name.is_empty())
        .take(limit)
        .collect::<Vec<_>>()
        .join(", ");
    (!joined.is_empty()).then_some(joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_full_payload() {
        let payload = json!({
            "title": "The Matrix",
            "overview": "A hacker learns the truth.",
            "release_date": "1999-03-31",
            "poster_path": "/matrix.jpg",
            "genres": [{"name": "Action"}, {"name": "Science Fiction"}],
            "keywords": {"keywords": [{"name": "simulation"}, {"name": "dystopia"}]},
            "credits": {
                "cast": [{"name": "Keanu Reeves"}, {"name": "Carrie-Anne Moss"}],
                "crew": [
                    {"name": "Lana Wachowski", "job": "Director"},
                    {"name": "Bill Pope", "job": "Director of Photography"},
                    {"name": "Lilly Wachowski", "job": "Director"}
                ]
            },
            "alternative_titles": {"titles": [{"title": "黑客帝国"}, {"title": "Matrix"}]}
        });

        let values = normalize_payload(&payload, &TmdbLimits::default());
        assert_eq!(values.title.as_deref(), Some("The Matrix"));
        assert_eq!(values.genre.as_deref(), Some("Action, Science Fiction"));
        assert_eq!(values.keywords.as_deref(), Some("simulation, dystopia"));
        assert_eq!(
            values.actors.as_deref(),
            Some("Keanu Reeves, Carrie-Anne Moss")
        );
        // Only the Director job counts.
        assert_eq!(
            values.directors.as_deref(),
            Some("Lana Wachowski, Lilly Wachowski")
        );
        assert_eq!(values.aka.as_deref(), Some("黑客帝国, Matrix"));
        assert_eq!(values.release_year, Some(1999));
        assert_eq!(values.poster_path.as_deref(), Some("/matrix.jpg"));
    }

    #[test]
    fn test_normalize_tv_payload_uses_name_and_first_air_date() {
        let payload = json!({
            "name": "JoJo's Bizarre Adventure",
            "first_air_date": "2012-10-06",
            "alternative_titles": {"results": [{"title": "ジョジョの奇妙な冒険"}]}
        });
        let values = normalize_payload(&payload, &TmdbLimits::default());
        assert_eq!(values.title.as_deref(), Some("JoJo's Bizarre Adventure"));
        assert_eq!(values.release_year, Some(2012));
        assert_eq!(values.aka.as_deref(), Some("ジョジョの奇妙な冒険"));
    }

    #[test]
    fn test_limits_are_applied() {
        let cast: Vec<Value> = (0..20)
            .map(|i| json!({"name": format!("Actor {}", i)}))
            .collect();
        let payload = json!({"title": "X", "credits": {"cast": cast}});
        let limits = TmdbLimits {
            actors: 3,
            directors: 5,
            aka: 10,
        };
        let values = normalize_payload(&payload, &limits);
        assert_eq!(values.actors.as_deref(), Some("Actor 0, Actor 1, Actor 2"));
    }

    #[test]
    fn test_empty_payload_yields_nones() {
        let values = normalize_payload(&json!({}), &TmdbLimits::default());
        assert_eq!(values, TmdbValues::default());
    }

    #[tokio::test]
    async fn test_client_paces_outbound_requests() {
        let config = TmdbConfig {
            rate_per_second: 10,
            ..Default::default()
        };
        let client = TmdbClient::new(&config, "test-key".to_string()).unwrap();

        let start = std::time::Instant::now();
        // The burst budget covers the first slots, then spacing kicks in.
        for _ in 0..12 {
            client.limiter.until_ready().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
