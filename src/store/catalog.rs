//! Channels, pipelines, decoders and post-hooks.
//!
//! The catalog decides which pipelines receive a task when an event arrives
//! on a channel. It is loaded from configuration on startup and is not
//! journaled.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::git::cache::repo_dir;
use crate::types::{PackageUri, PostHook};

/// Errors from catalog validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("duplicate {kind} name: {name}")]
    Duplicate { kind: &'static str, name: String },

    #[error("channel {channel} references unknown decoder {decoder}")]
    UnknownDecoder { channel: String, decoder: String },

    #[error("pipeline {pipeline} references unknown post hook {post_hook}")]
    UnknownPostHook { pipeline: String, post_hook: String },

    #[error("pipeline {pipeline} subscribes to unknown channel {channel}")]
    UnknownChannel { pipeline: String, channel: String },

    #[error("pipeline {pipeline} has unusable repository {repo}: {reason}")]
    InvalidRepo {
        pipeline: String,
        repo: String,
        reason: String,
    },
}

/// An ingress channel. Events are posted to a channel by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    /// Name of the decoder that turns raw payloads into image references.
    /// Without one the payload is read as newline-delimited references.
    #[serde(default)]
    pub decoder: Option<String>,
}

/// A named decoder script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decoder {
    pub name: String,
    pub script: String,
}

/// A target repository subscribed to one or more channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub repo_uri: PackageUri,
    #[serde(default)]
    pub dest_branch: Option<String>,
    #[serde(default)]
    pub post_hook: Option<String>,
    #[serde(default)]
    pub channels: Vec<String>,
}

/// The full routing configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default, rename = "channel")]
    pub channels: Vec<Channel>,
    #[serde(default, rename = "decoder")]
    pub decoders: Vec<Decoder>,
    #[serde(default, rename = "post_hook")]
    pub post_hooks: Vec<PostHook>,
    #[serde(default, rename = "pipeline")]
    pub pipelines: Vec<Pipeline>,
}

impl Catalog {
    /// Adds a channel without a decoder.
    pub fn with_channel(mut self, name: impl Into<String>) -> Self {
        self.channels.push(Channel {
            name: name.into(),
            decoder: None,
        });
        self
    }

    /// Adds a channel decoded by `script`. The decoder is named after the
    /// channel.
    pub fn with_decoded_channel(mut self, name: impl Into<String>, script: impl Into<String>) -> Self {
        let name = name.into();
        self.decoders.push(Decoder {
            name: name.clone(),
            script: script.into(),
        });
        self.channels.push(Channel {
            decoder: Some(name.clone()),
            name,
        });
        self
    }

    /// Adds a pipeline.
    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipelines.push(pipeline);
        self
    }

    /// Adds a post-hook.
    pub fn with_post_hook(mut self, name: impl Into<String>, script: impl Into<String>) -> Self {
        self.post_hooks.push(PostHook {
            name: name.into(),
            script: script.into(),
        });
        self
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn decoder(&self, name: &str) -> Option<&Decoder> {
        self.decoders.iter().find(|d| d.name == name)
    }

    pub fn post_hook(&self, name: &str) -> Option<&PostHook> {
        self.post_hooks.iter().find(|h| h.name == name)
    }

    /// Pipelines subscribed to `channel`, in declaration order.
    pub fn subscribers<'a>(&'a self, channel: &'a str) -> impl Iterator<Item = &'a Pipeline> + 'a {
        self.pipelines
            .iter()
            .filter(move |p| p.channels.iter().any(|c| c == channel))
    }

    /// Checks names are unique, every reference resolves, and every pipeline
    /// repository maps to a cache directory.
    pub fn validate(&self) -> Result<(), CatalogError> {
        unique("channel", self.channels.iter().map(|c| c.name.as_str()))?;
        unique("decoder", self.decoders.iter().map(|d| d.name.as_str()))?;
        unique("post_hook", self.post_hooks.iter().map(|h| h.name.as_str()))?;
        unique("pipeline", self.pipelines.iter().map(|p| p.name.as_str()))?;

        for channel in &self.channels {
            if let Some(decoder) = &channel.decoder
                && self.decoder(decoder).is_none()
            {
                return Err(CatalogError::UnknownDecoder {
                    channel: channel.name.clone(),
                    decoder: decoder.clone(),
                });
            }
        }

        for pipeline in &self.pipelines {
            let invalid_repo = |reason: String| CatalogError::InvalidRepo {
                pipeline: pipeline.name.clone(),
                repo: pipeline.repo_uri.to_string(),
                reason,
            };
            repo_dir(&pipeline.repo_uri.repo).map_err(|e| invalid_repo(e.to_string()))?;
            if !pipeline.repo_uri.has_safe_pkg() {
                return Err(invalid_repo(format!(
                    "pkg {:?} leaves the repository",
                    pipeline.repo_uri.pkg
                )));
            }

            if let Some(post_hook) = &pipeline.post_hook
                && self.post_hook(post_hook).is_none()
            {
                return Err(CatalogError::UnknownPostHook {
                    pipeline: pipeline.name.clone(),
                    post_hook: post_hook.clone(),
                });
            }
            for channel in &pipeline.channels {
                if self.channel(channel).is_none() {
                    return Err(CatalogError::UnknownChannel {
                        pipeline: pipeline.name.clone(),
                        channel: channel.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

fn unique<'a>(kind: &'static str, names: impl Iterator<Item = &'a str>) -> Result<(), CatalogError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(CatalogError::Duplicate {
                kind,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}
