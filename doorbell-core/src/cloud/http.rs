use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::events::Event;
use crate::session::Credential;

use super::{
    CloudApi, Device, EventPage, EventPageQuery, FetchError, FetchResult, PlaylistDocument,
};

#[derive(Debug, Clone)]
pub struct HttpCloudSettings {
    pub api_base_url: String,
    pub region: String,
    pub language: String,
    pub timeout: Duration,
}

/// JSON-over-HTTPS client for the vendor's camera API.
#[derive(Debug, Clone)]
pub struct HttpCloudApi {
    client: Client,
    settings: HttpCloudSettings,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(alias = "result")]
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    #[serde(default)]
    list: Vec<Device>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventListData {
    #[serde(default)]
    is_continue: bool,
    #[serde(default)]
    next_time: Option<i64>,
    #[serde(default)]
    third_part_play_units: Vec<PlayUnit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayUnit {
    create_time: Option<i64>,
    file_id: Option<String>,
    event_type: Option<String>,
}

impl HttpCloudApi {
    pub fn new(settings: HttpCloudSettings) -> FetchResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("doorbell-archiver/", env!("CARGO_PKG_VERSION")))
            .timeout(settings.timeout)
            .build()
            .map_err(|err| FetchError::Network(err.to_string()))?;
        Ok(Self { client, settings })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.settings.api_base_url.trim_end_matches('/'),
            path
        )
    }

    fn authorize(&self, builder: RequestBuilder, credential: &Credential) -> RequestBuilder {
        let mut cookie = format!(
            "userId={}; serviceToken={}; yetAnotherServiceToken={}; locale={}",
            credential.user_id,
            credential.service_token,
            credential.service_token,
            self.settings.language
        );
        if let Some(cuser_id) = &credential.cuser_id {
            cookie.push_str(&format!("; cUserId={cuser_id}"));
        }
        builder.header(reqwest::header::COOKIE, cookie)
    }

    async fn send(&self, builder: RequestBuilder) -> FetchResult<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> FetchResult<T> {
        let envelope: Envelope<T> = self.send(builder).await?.json().await?;
        match envelope.code {
            0 => envelope
                .data
                .ok_or_else(|| FetchError::Malformed("response without data".into())),
            401 | 403 => Err(FetchError::Unauthorized),
            code => Err(FetchError::Remote {
                code,
                message: envelope.message.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl CloudApi for HttpCloudApi {
    async fn list_devices(&self, credential: &Credential) -> FetchResult<Vec<Device>> {
        let request = self.authorize(
            self.client
                .post(self.endpoint("home/device_list"))
                .json(&json!({ "getVirtualModel": false, "getHuamiDevices": 0 })),
            credential,
        );
        let devices: DeviceList = self.send_json(request).await?;
        debug!(count = devices.list.len(), "device list fetched");
        Ok(devices.list)
    }

    async fn event_page(
        &self,
        credential: &Credential,
        device: &Device,
        query: &EventPageQuery,
    ) -> FetchResult<EventPage> {
        let params: Vec<(&str, String)> = vec![
            ("did", device.did.clone()),
            ("model", device.model.clone()),
            ("doorBell", "true".into()),
            ("eventType", "Default".into()),
            ("needMerge", "true".into()),
            ("sortType", "DESC".into()),
            ("region", self.settings.region.to_uppercase()),
            ("language", self.settings.language.clone()),
            ("beginTime", query.begin.timestamp_millis().to_string()),
            ("endTime", query.end.timestamp_millis().to_string()),
            ("limit", query.limit.to_string()),
        ];
        let request = self.authorize(
            self.client
                .get(self.endpoint("common/app/get/eventlist"))
                .query(&params),
            credential,
        );
        let data: EventListData = self.send_json(request).await?;

        let mut page = EventPage {
            has_more: data.is_continue,
            next_end: data.next_time.and_then(millis_to_utc),
            ..EventPage::default()
        };
        for unit in data.third_part_play_units {
            let event = match (unit.file_id, unit.create_time) {
                (Some(file_id), Some(created)) if !file_id.is_empty() => Event::from_millis(
                    file_id,
                    created,
                    unit.event_type.unwrap_or_default(),
                ),
                _ => None,
            };
            match event {
                Some(event) => page.events.push(event),
                None => {
                    warn!(did = %device.did, "skipping event entry with missing fields");
                    page.skipped += 1;
                }
            }
        }
        Ok(page)
    }

    async fn segment_playlist(
        &self,
        credential: &Credential,
        device: &Device,
        event: &Event,
    ) -> FetchResult<PlaylistDocument> {
        let params = [
            ("did", device.did.as_str()),
            ("model", device.model.as_str()),
            ("fileId", event.event_id.as_str()),
            ("isAlarm", "true"),
            ("videoCodec", "H265"),
        ];
        let request = self.authorize(
            self.client
                .get(self.endpoint("common/app/m3u8"))
                .query(&params),
            credential,
        );
        let response = self.send(request).await?;
        let url = response.url().to_string();
        let body = response.text().await?;
        Ok(PlaylistDocument { url, body })
    }
}

fn millis_to_utc(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
