use crate::config::InfluxConfig;
use influxdb::{Client, ReadQuery, Timestamp, Type, WriteQuery};
use log::*;
use we515_lib::ingest::{FieldValue, StorePoint, LOCATION_TAG};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Influx(#[from] influxdb::Error),
    #[error("Point time {0} cannot be stored with nanosecond precision")]
    TimeOutOfRange(String),
}

fn field_type(value: &FieldValue) -> Type {
    match value {
        FieldValue::Float(v) => Type::Float(*v),
        FieldValue::Integer(v) => Type::SignedInteger(*v),
        FieldValue::Boolean(v) => Type::Boolean(*v),
        FieldValue::Text(v) => Type::Text(v.clone()),
    }
}

/// Builds the line protocol write for one point.
pub fn write_query(point: &StorePoint) -> Result<WriteQuery, StoreError> {
    let nanos = point
        .time
        .timestamp_nanos_opt()
        .and_then(|nanos| u128::try_from(nanos).ok())
        .ok_or_else(|| StoreError::TimeOutOfRange(point.time_rfc3339()))?;
    let query = WriteQuery::new(Timestamp::Nanoseconds(nanos), point.measurement.as_str())
        .add_tag(LOCATION_TAG, point.location.as_str());
    Ok(point
        .fields
        .iter()
        .fold(query, |query, (name, value)| query.add_field(name, field_type(value))))
}

/// InfluxDB 1.x database the bridge writes into.
pub struct Store {
    client: Client,
    database: String,
}

impl Store {
    pub fn new(config: &InfluxConfig) -> Self {
        let client = Client::new(config.url.clone(), config.database.clone());
        let client = match (&config.username, &config.password) {
            (Some(user), Some(password)) => client.with_auth(user, password),
            _ => client,
        };
        Self {
            client,
            database: config.database.clone(),
        }
    }

    /// Creates the database unless it exists already.
    pub async fn ensure_database(&self) -> Result<(), StoreError> {
        info!("Ensuring InfluxDB database {} exists", self.database);
        let query = ReadQuery::new(format!("CREATE DATABASE \"{}\"", self.database));
        let response = self.client.query(query).await?;
        trace!("CREATE DATABASE response: {response}");
        Ok(())
    }

    pub async fn write(&self, point: &StorePoint) -> Result<(), StoreError> {
        let query = write_query(point)?;
        self.client.query(query).await?;
        debug!("Stored {point}");
        Ok(())
    }
}
