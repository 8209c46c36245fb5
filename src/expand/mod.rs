//! Query expansion
//!
//! Two sources feed the expansion: a static Chinese/English genre and
//! term table, and the enrichment table (title/aka/keyword ILIKE
//! lookup) under a strict statement timeout. Expansion never fails a
//! search; on timeout or error it silently contributes nothing.

use crate::state::validate_identifier;
use chrono::Utc;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::time::Duration;
use tracing::debug;

/// Token budget for the expanded query.
const MAX_TOKENS: usize = 8;

/// Tokens carried into the cross-language secondary query.
const MAX_ENGLISH_TOKENS: usize = 3;

/// Chinese genre term, its canonical genre labels, and extra search
/// terms folded into expansion.
const GENRE_TABLE: &[(&str, &str, &str)] = &[
    ("惊悚", "Thriller", "thriller"),
    ("恐怖", "Horror", "horror"),
    ("悬疑", "Mystery", "mystery"),
    ("动作", "Action", "action"),
    ("科幻", "Science Fiction", "sci-fi"),
    ("犯罪", "Crime", "crime"),
    ("爱情", "Romance", "romance"),
    ("喜剧", "Comedy", "comedy"),
    ("剧情", "Drama", "drama"),
    ("冒险", "Adventure", "adventure"),
    ("动画", "Animation", "animation"),
    ("奇幻", "Fantasy", "fantasy"),
    ("战争", "War", "war"),
    ("纪录", "Documentary", "documentary"),
    ("家庭", "Family", "family"),
    ("音乐", "Music", "music"),
    ("历史", "History", "history"),
    ("西部", "Western", "western"),
];

/// Result of expanding a user query.
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    /// Original query followed by the ranked expansion tokens
    pub expanded_query: String,
    /// Top ASCII tokens only; drives the cross-language hop
    pub english_expansion: String,
}

/// Genre filter values for a query: both the Chinese term and its
/// canonical label, for payloads tagged either way.
pub fn extract_genres(query: &str) -> Vec<String> {
    let mut out = Vec::new();
    for (zh, canonical, _) in GENRE_TABLE {
        if query.contains(zh) {
            for value in [*zh, *canonical] {
                if !out.iter().any(|v| v == value) {
                    out.push(value.to_string());
                }
            }
        }
    }
    out
}

/// Static expansion terms for Chinese genre words in the query.
fn static_terms(query: &str) -> Vec<String> {
    GENRE_TABLE
        .iter()
        .filter(|(zh, _, _)| query.contains(zh))
        .map(|(_, _, term)| term.to_string())
        .collect()
}

/// Split an aka/keywords column into candidate tokens. Splitting on
/// whitespace would shred multi-word titles, so only list delimiters
/// count.
pub fn split_tokens(raw: &str) -> Vec<String> {
    raw.split(['\u{ff0c}', ',', ';', '/', '\u{00b7}', '|', '\n'])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_strong_ascii(token: &str) -> bool {
    token.is_ascii() && token.len() >= 3
}

/// Deduplicate and rank tokens: ASCII tokens of length >= 3 first,
/// original order preserved within each class, capped to the budget.
pub fn rank_tokens(tokens: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut deduped: Vec<String> = Vec::new();
    for token in tokens {
        if seen.insert(token.to_lowercase()) {
            deduped.push(token);
        }
    }
    deduped.sort_by_key(|t| !is_strong_ascii(t));
    deduped.truncate(MAX_TOKENS);
    deduped
}

/// Enrichment-backed query expander
pub struct QueryExpander {
    pool: PgPool,
    schema: String,
    timeout_ms: u64,
    limit: usize,
}

impl QueryExpander {
    pub fn new(pool: PgPool, schema: &str, timeout_ms: u64, limit: usize) -> crate::error::Result<Self> {
        validate_identifier(schema)?;
        Ok(Self {
            pool,
            schema: schema.to_string(),
            timeout_ms,
            limit,
        })
    }

    /// Expand `q`. Degrades to the static terms (or nothing) when the
    /// enrichment lookup misses its budget.
    pub async fn expand(&self, q: &str) -> Expansion {
        let mut tokens = static_terms(q);

        let started = Utc::now();
        match tokio::time::timeout(
            Duration::from_millis(self.timeout_ms),
            self.lookup_terms(q),
        )
        .await
        {
            Ok(Ok(found)) => tokens.extend(found),
            Ok(Err(e)) => debug!("expansion lookup skipped: {}", e),
            Err(_) => debug!(
                "expansion lookup timed out after {}ms",
                (Utc::now() - started).num_milliseconds()
            ),
        }

        let ranked = rank_tokens(tokens);
        build_expansion(q, ranked)
    }

    /// ILIKE the enrichment table for titles, akas and keywords
    /// matching the query, under a server-side statement timeout.
    async fn lookup_terms(&self, q: &str) -> crate::error::Result<Vec<String>> {
        let pattern = format!("%{}%", q.replace('%', "\\%").replace('_', "\\_"));
        let sql = format!(
            "SELECT aka, keywords FROM {}.tmdb_enrichment \
             WHERE status = 'ok' \
               AND (title ILIKE $1 OR aka ILIKE $1 OR keywords ILIKE $1) \
             LIMIT $2",
            self.schema
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            self.timeout_ms
        ))
        .execute(&mut *tx)
        .await?;
        let rows = sqlx::query(&sql)
            .bind(&pattern)
            .bind(self.limit as i64)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut tokens = Vec::new();
        for row in rows {
            for column in ["aka", "keywords"] {
                if let Ok(Some(value)) = row.try_get::<Option<String>, _>(column) {
                    tokens.extend(split_tokens(&value));
                }
            }
        }
        Ok(tokens)
    }
}

/// Assemble the final expansion strings from ranked tokens.
pub fn build_expansion(q: &str, ranked: Vec<String>) -> Expansion {
    let english: Vec<&str> = ranked
        .iter()
        .filter(|t| is_strong_ascii(t))
        .take(MAX_ENGLISH_TOKENS)
        .map(String::as_str)
        .collect();
    let english_expansion = english.join(" ");

    let expanded_query = if ranked.is_empty() {
        q.to_string()
    } else {
        format!("{} {}", q, ranked.join(" "))
    };

    Expansion {
        expanded_query,
        english_expansion,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_preserves_multiword_titles() {
        let tokens = split_tokens("JoJo's Bizarre Adventure,ジョジョの奇妙な冒険");
        assert_eq!(
            tokens,
            vec!["JoJo's Bizarre Adventure", "ジョジョの奇妙な冒険"]
        );
    }

    #[test]
    fn test_split_on_all_delimiters() {
        let tokens = split_tokens("a，b;c/d·e|f\ng");
        assert_eq!(tokens, vec!["a", "b", "c", "d", "e", "f", "g"]);
    }

    #[test]
    fn test_rank_prefers_long_ascii_and_caps_budget() {
        let tokens: Vec<String> = vec![
            "奇妙冒险",
            "JoJo's Bizarre Adventure",
            "ab",
            "stardust crusaders",
            "黄金の風",
            "golden wind",
            "t1",
            "t2",
            "t3",
            "t4",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let ranked = rank_tokens(tokens);
        assert_eq!(ranked.len(), 8);
        assert_eq!(ranked[0], "JoJo's Bizarre Adventure");
        assert_eq!(ranked[1], "stardust crusaders");
        assert_eq!(ranked[2], "golden wind");
        // Weak tokens fill the tail in original order.
        assert_eq!(ranked[3], "奇妙冒险");
    }

    #[test]
    fn test_rank_dedupes_case_insensitively() {
        let ranked = rank_tokens(vec![
            "Golden Wind".to_string(),
            "golden wind".to_string(),
            "thriller".to_string(),
        ]);
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn test_build_expansion_appends_tokens_and_selects_english() {
        let expansion = build_expansion(
            "jojo奇妙冒险",
            vec![
                "JoJo's Bizarre Adventure".to_string(),
                "stardust crusaders".to_string(),
                "golden wind".to_string(),
                "heritage for the future".to_string(),
                "奇妙冒险".to_string(),
            ],
        );
        assert!(expansion.expanded_query.starts_with("jojo奇妙冒险 "));
        assert!(expansion.expanded_query.contains("JoJo's Bizarre Adventure"));
        assert_eq!(
            expansion.english_expansion,
            "JoJo's Bizarre Adventure stardust crusaders golden wind"
        );
    }

    #[test]
    fn test_no_tokens_leaves_query_untouched() {
        let expansion = build_expansion("matrix", Vec::new());
        assert_eq!(expansion.expanded_query, "matrix");
        assert!(expansion.english_expansion.is_empty());
    }

    #[test]
    fn test_extract_genres_maps_chinese_terms() {
        let genres = extract_genres("高分惊悚电影");
        assert_eq!(genres, vec!["惊悚", "Thriller"]);
        assert!(extract_genres("plain english").is_empty());
    }

    #[test]
    fn test_static_terms_feed_expansion() {
        let terms = static_terms("科幻惊悚");
        assert_eq!(terms, vec!["thriller", "sci-fi"]);
    }
}
