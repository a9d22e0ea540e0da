use std::{io::Read, time::Duration};

use chrono::{DateTime, Utc};
use reqwest::{
   StatusCode,
   blocking::{Body, Client, RequestBuilder, Response},
};

use super::{ActionRecord, CoreClient, FileRecord, PairRequest, PairResponse, RestoreRequest};
use crate::{Result, error::ReplicationError, journal::Lifetime};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`CoreClient`] speaking to a core over HTTP with a bearer key.
///
/// Uses the blocking client; call it from worker threads, not from inside an
/// async runtime.
#[derive(Debug, Clone)]
pub struct HttpCoreClient {
   client:  Client,
   base:    String,
   api_key: String,
}

impl HttpCoreClient {
   pub fn new(address: &str, api_key: &str) -> Result<Self> {
      let client = Client::builder().connect_timeout(REQUEST_TIMEOUT).build()?;
      Ok(Self {
         client,
         base: address.trim_end_matches('/').to_string(),
         api_key: api_key.to_string(),
      })
   }

   fn url(&self, route: &str) -> String {
      format!("{}/api{route}", self.base)
   }

   fn send(&self, op: &'static str, req: RequestBuilder) -> Result<Response> {
      let response = req.bearer_auth(&self.api_key).send()?;
      match response.status() {
         s if s.is_success() => Ok(response),
         StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(ReplicationError::Unauthorized.into())
         },
         StatusCode::NOT_FOUND => Err(ReplicationError::Missing(op.to_string()).into()),
         s => Err(ReplicationError::Status { op, status: s.as_u16() }.into()),
      }
   }

   fn get(&self, op: &'static str, route: &str) -> Result<Response> {
      let req = self.client.get(self.url(route)).timeout(REQUEST_TIMEOUT);
      self.send(op, req)
   }
}

impl CoreClient for HttpCoreClient {
   fn pair(&self, request: &PairRequest) -> Result<PairResponse> {
      let req = self
         .client
         .post(self.url("/remote"))
         .timeout(REQUEST_TIMEOUT)
         .json(request);
      Ok(self.send("pair", req)?.json()?)
   }

   fn history_since(&self, since: DateTime<Utc>) -> Result<Vec<ActionRecord>> {
      let route = format!("/history/since/{}", since.timestamp_millis());
      Ok(self.get("history", &route)?.json()?)
   }

   fn list_files(&self, dir_id: &str) -> Result<Vec<FileRecord>> {
      let req = self
         .client
         .get(self.url("/files"))
         .query(&[("dir", dir_id)])
         .timeout(REQUEST_TIMEOUT);
      Ok(self.send("list files", req)?.json()?)
   }

   fn file_info(&self, file_id: &str) -> Result<FileRecord> {
      Ok(self.get("file info", &format!("/file/{file_id}"))?.json()?)
   }

   // Content downloads may take longer than metadata calls, so they only
   // carry the connect timeout.
   fn file_content(&self, file_id: &str) -> Result<Box<dyn Read + Send>> {
      let req = self.client.get(self.url(&format!("/file/{file_id}/content")));
      Ok(Box::new(self.send("file content", req)?))
   }

   fn media_content(&self, content_id: &str) -> Result<Box<dyn Read + Send>> {
      let req = self.client.get(self.url(&format!("/media/{content_id}/content")));
      Ok(Box::new(self.send("media content", req)?))
   }

   fn restore_init(&self, request: &RestoreRequest) -> Result<()> {
      let req = self
         .client
         .post(self.url("/restore/init"))
         .timeout(REQUEST_TIMEOUT)
         .json(request);
      self.send("restore init", req)?;
      Ok(())
   }

   // A full history can be large; like content transfers it only carries
   // the connect timeout.
   fn restore_history(&self, lifetimes: &[Lifetime]) -> Result<usize> {
      let req = self.client.post(self.url("/restore/history")).json(lifetimes);
      Ok(self.send("restore history", req)?.json()?)
   }

   fn restore_file(&self, lifetime_id: &str, content: Box<dyn Read + Send>) -> Result<FileRecord> {
      let req = self
         .client
         .post(self.url("/restore/file"))
         .query(&[("fileId", lifetime_id)])
         .body(Body::new(content));
      Ok(self.send("restore file", req)?.json()?)
   }

   fn restore_complete(&self) -> Result<()> {
      let req = self
         .client
         .post(self.url("/restore/complete"))
         .timeout(REQUEST_TIMEOUT);
      self.send("restore complete", req)?;
      Ok(())
   }
}
