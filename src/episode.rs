use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::DownloadError;

/// An episode as supplied by the content layer.
///
/// The core treats it as opaque apart from `audio_url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub id: String,
    pub title: String,
    pub audio_url: String,
    /// Duration in seconds, when the content layer knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default)]
    pub guests: Vec<String>,
    #[serde(default)]
    pub language: String,
}

impl Episode {
    pub fn has_audio_url(&self) -> bool {
        !self.audio_url.trim().is_empty()
    }

    /// Parse the audio URL, rejecting episodes a transfer could never start for
    pub fn parsed_audio_url(&self) -> Result<Url, DownloadError> {
        if !self.has_audio_url() {
            return Err(DownloadError::MissingAudioUrl {
                episode_id: self.id.clone(),
            });
        }
        Url::parse(self.audio_url.trim()).map_err(|source| DownloadError::InvalidAudioUrl {
            episode_id: self.id.clone(),
            source,
        })
    }
}

#[cfg(test)]
pub(crate) fn make_episode(id: &str) -> Episode {
    Episode {
        id: id.to_string(),
        title: format!("Episode {id}"),
        audio_url: format!("https://cdn.example.com/audio/{id}.mp3"),
        duration: Some(1800.0),
        image_url: None,
        slug: Some(format!("episode-{id}")),
        guests: vec![],
        language: "en".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_content_layer_json() {
        let json = r#"{
            "id": "ep-42",
            "title": "Forty Two",
            "audioUrl": "https://cdn.example.com/42.mp3",
            "duration": 2712.5,
            "imageUrl": "https://cdn.example.com/42.jpg",
            "guests": ["Ada", "Grace"],
            "language": "de"
        }"#;

        let episode: Episode = serde_json::from_str(json).unwrap();

        assert_eq!(episode.id, "ep-42");
        assert_eq!(episode.audio_url, "https://cdn.example.com/42.mp3");
        assert_eq!(episode.duration, Some(2712.5));
        assert_eq!(episode.guests, vec!["Ada", "Grace"]);
        assert!(episode.slug.is_none());
    }

    #[test]
    fn missing_optional_fields_default() {
        let json = r#"{"id": "1", "title": "t", "audioUrl": "https://x.test/a.mp3"}"#;
        let episode: Episode = serde_json::from_str(json).unwrap();

        assert!(episode.guests.is_empty());
        assert!(episode.language.is_empty());
        assert!(episode.duration.is_none());
    }

    #[test]
    fn blank_audio_url_is_rejected() {
        let mut episode = make_episode("a");
        episode.audio_url = "   ".to_string();

        assert!(!episode.has_audio_url());
        assert!(matches!(
            episode.parsed_audio_url(),
            Err(DownloadError::MissingAudioUrl { .. })
        ));
    }

    #[test]
    fn malformed_audio_url_is_rejected() {
        let mut episode = make_episode("a");
        episode.audio_url = "cdn/a.mp3".to_string();

        assert!(matches!(
            episode.parsed_audio_url(),
            Err(DownloadError::InvalidAudioUrl { .. })
        ));
    }
}
