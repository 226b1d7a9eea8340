//! Bearer-authenticated JSON client for the tracker REST API. Endpoint URL
//! composition and credentials are supplied by the caller's configuration.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use serde::de::DeserializeOwned;

use crate::wire::{RawActivity, RawActivityPage, RawAgile, RawIssue, RawProject, RawSprint};
use crate::{
    classify_status, drain, ApiError, Direction, Page, PageRequest, PageSource, RateLimitConfig,
    RateLimiter, Resume, RetryPolicy,
};

const BOARD_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub rate: RateLimitConfig,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct TrackerClient {
    http: reqwest::Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl TrackerClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .context("building authorization header")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            http: builder.build().context("building http client")?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limiter: Arc::new(RateLimiter::new(config.rate)),
            retry: config.retry,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn fetch_once<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let _permit = self.limiter.acquire().await;
        let response = self.http.get(url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(classify_status(status, url, retry_after));
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|source| ApiError::Decode {
            url: url.to_string(),
            source,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let url = self.endpoint(path);
        self.retry
            .run(path, || self.fetch_once::<T>(&url, query))
            .await
    }

    pub async fn project(&self, project_id: &str) -> Result<RawProject, ApiError> {
        self.get_json(
            &format!("admin/projects/{project_id}"),
            &[("fields", "id,name,shortName".to_string())],
        )
        .await
    }

    pub async fn issue_detail(&self, issue_id: &str, fields: &str) -> Result<RawIssue, ApiError> {
        self.get_json(
            &format!("issues/{issue_id}"),
            &[("fields", fields.to_string())],
        )
        .await
    }

    /// Offset-paged issue listing. Safe here because a run reads the listing
    /// once up-front; live mutation during iteration is the cursor
    /// endpoints' territory.
    pub fn issues<'a>(&'a self, project_id: &str, fields: &str) -> IssueListSource<'a> {
        IssueListSource {
            client: self,
            query: format!("project: {{{project_id}}}"),
            fields: fields.to_string(),
        }
    }

    /// Cursor-paged activity log for one issue.
    pub fn activities<'a>(&'a self, issue_id: &str, fields: &str) -> ActivitySource<'a> {
        ActivitySource {
            client: self,
            issue_id: issue_id.to_string(),
            fields: fields.to_string(),
        }
    }

    /// Offset-paged listing over any endpoint returning a plain JSON array.
    pub fn offset_list<'a, T>(&'a self, path: &str, fields: &str) -> OffsetListSource<'a, T> {
        OffsetListSource {
            client: self,
            path: path.to_string(),
            fields: fields.to_string(),
            _marker: PhantomData,
        }
    }

    /// Sprints for the agile board carrying this project. A project without
    /// a board yields an empty list rather than an error.
    pub async fn sprints(&self, project_id: &str) -> Result<Vec<RawSprint>, ApiError> {
        let boards = self.offset_list::<RawAgile>("agiles", "id,name,projects(id,name,shortName)");
        let first = PageRequest::Offset {
            skip: 0,
            top: BOARD_PAGE_SIZE,
        };
        let agiles = drain(&boards, first).await?;

        let board = agiles.into_iter().find(|agile| {
            agile.projects.iter().any(|p| {
                p.id == project_id
                    || p.name == project_id
                    || p.short_name.as_deref() == Some(project_id)
            })
        });
        let Some(board) = board else {
            return Ok(Vec::new());
        };

        let sprints = self.offset_list::<RawSprint>(
            &format!("agiles/{}/sprints", board.id),
            "id,name,goal,start,finish",
        );
        let first = PageRequest::Offset {
            skip: 0,
            top: BOARD_PAGE_SIZE,
        };
        match drain(&sprints, first).await {
            Ok(sprints) => Ok(sprints),
            Err(ApiError::NotFound { .. }) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }
}

/// Generic offset pager for list endpoints without cursor support. The
/// issue listing keeps its own source because of the query parameter.
pub struct OffsetListSource<'a, T> {
    client: &'a TrackerClient,
    path: String,
    fields: String,
    _marker: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T: DeserializeOwned + Send> PageSource for OffsetListSource<'_, T> {
    type Item = T;

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page<Self::Item>, ApiError> {
        let PageRequest::Offset { skip, top } = request else {
            return Err(ApiError::Unsupported {
                url: self.client.endpoint(&self.path),
            });
        };
        let items: Vec<T> = self
            .client
            .get_json(
                &self.path,
                &[
                    ("fields", self.fields.clone()),
                    ("$skip", skip.to_string()),
                    ("$top", top.to_string()),
                ],
            )
            .await?;
        let has_more = items.len() == *top && *top > 0;
        Ok(Page {
            resume: Resume::Offset {
                next_skip: skip + items.len(),
            },
            has_more,
            items,
        })
    }
}

pub struct IssueListSource<'a> {
    client: &'a TrackerClient,
    query: String,
    fields: String,
}

#[async_trait]
impl PageSource for IssueListSource<'_> {
    type Item = RawIssue;

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page<Self::Item>, ApiError> {
        let PageRequest::Offset { skip, top } = request else {
            return Err(ApiError::Unsupported {
                url: self.client.endpoint("issues"),
            });
        };
        let items: Vec<RawIssue> = self
            .client
            .get_json(
                "issues",
                &[
                    ("fields", self.fields.clone()),
                    ("query", self.query.clone()),
                    ("$skip", skip.to_string()),
                    ("$top", top.to_string()),
                ],
            )
            .await?;
        // A page shorter than requested ends the collection.
        let has_more = items.len() == *top && *top > 0;
        Ok(Page {
            resume: Resume::Offset {
                next_skip: skip + items.len(),
            },
            has_more,
            items,
        })
    }
}

pub struct ActivitySource<'a> {
    client: &'a TrackerClient,
    issue_id: String,
    fields: String,
}

#[async_trait]
impl PageSource for ActivitySource<'_> {
    type Item = RawActivity;

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page<Self::Item>, ApiError> {
        let path = format!("issues/{}/activitiesPage", self.issue_id);
        let PageRequest::Cursor {
            cursor,
            direction,
            top,
        } = request
        else {
            return Err(ApiError::Unsupported {
                url: self.client.endpoint(&path),
            });
        };

        let mut query = vec![
            ("fields", self.fields.clone()),
            ("$top", top.to_string()),
            (
                "reverse",
                matches!(direction, Direction::Backward).to_string(),
            ),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.clone()));
        }

        let page: RawActivityPage = self.client.get_json(&path, &query).await?;
        let (next_cursor, has_more) = match direction {
            Direction::Forward => (page.after_cursor, page.has_after),
            Direction::Backward => (page.before_cursor, page.has_before),
        };
        Ok(Page {
            items: page.activities,
            resume: Resume::Cursor {
                next_cursor,
                direction: *direction,
            },
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RateLimitConfig;

    #[test]
    fn endpoint_composition_trims_slashes() {
        let client = TrackerClient::new(ClientConfig {
            base_url: "https://tracker.example.com/".into(),
            token: "secret".into(),
            timeout: Duration::from_secs(5),
            user_agent: None,
            rate: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
        })
        .expect("client");
        assert_eq!(
            client.endpoint("/issues/I-1/activitiesPage"),
            "https://tracker.example.com/api/issues/I-1/activitiesPage"
        );
    }

    #[tokio::test]
    async fn offset_board_listing_rejects_cursor_requests() {
        let client = TrackerClient::new(ClientConfig {
            base_url: "https://tracker.example.com".into(),
            token: "secret".into(),
            timeout: Duration::from_secs(5),
            user_agent: None,
            rate: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
        })
        .expect("client");

        let source = client.offset_list::<RawAgile>("agiles", "id,name");
        let request = PageRequest::Cursor {
            cursor: None,
            direction: Direction::Forward,
            top: 50,
        };
        let err = source.fetch_page(&request).await.unwrap_err();
        assert!(matches!(err, ApiError::Unsupported { url } if url.ends_with("/api/agiles")));
    }
}
