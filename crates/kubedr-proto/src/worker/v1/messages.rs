/// TLS material mounted into the worker for a database connection.
///
/// Paths are inside the worker pod; empty fields mean "not used".
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PostgresTls {
    #[prost(string, tag = "1")]
    pub client_cert_path: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub client_key_path: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub ca_cert_path: ::prost::alloc::string::String,
}

/// Connection target for a Postgres operation
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PostgresTarget {
    #[prost(string, tag = "1")]
    pub host: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub port: u32,
    #[prost(string, tag = "3")]
    pub username: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "4")]
    pub databases: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(message, optional, tag = "5")]
    pub tls: ::core::option::Option<PostgresTls>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DumpPostgresRequest {
    #[prost(message, optional, tag = "1")]
    pub target: ::core::option::Option<PostgresTarget>,
    /// Directory on a worker volume receiving one dump file per database
    #[prost(string, tag = "2")]
    pub output_dir: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DumpPostgresResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RestorePostgresRequest {
    #[prost(message, optional, tag = "1")]
    pub target: ::core::option::Option<PostgresTarget>,
    /// Directory on a worker volume holding the dump files
    #[prost(string, tag = "2")]
    pub input_dir: ::prost::alloc::string::String,
    /// Drop existing objects before restoring them
    #[prost(bool, tag = "3")]
    pub clean: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RestorePostgresResponse {}

/// Which way an object storage sync copies data
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SyncDirection {
    Unspecified = 0,
    /// Local path to bucket
    Upload = 1,
    /// Bucket to local path
    Download = 2,
}

impl SyncDirection {
    /// Name used in logs and the protobuf schema
    pub fn as_str_name(&self) -> &'static str {
        match self {
            SyncDirection::Unspecified => "SYNC_DIRECTION_UNSPECIFIED",
            SyncDirection::Upload => "SYNC_DIRECTION_UPLOAD",
            SyncDirection::Download => "SYNC_DIRECTION_DOWNLOAD",
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncObjectStorageRequest {
    #[prost(enumeration = "SyncDirection", tag = "1")]
    pub direction: i32,
    #[prost(string, tag = "2")]
    pub local_path: ::prost::alloc::string::String,
    /// `s3://bucket/prefix`
    #[prost(string, tag = "3")]
    pub remote_url: ::prost::alloc::string::String,
    /// Directory holding the mounted credentials secret
    #[prost(string, tag = "4")]
    pub credentials_dir: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub endpoint: ::prost::alloc::string::String,
    #[prost(string, tag = "6")]
    pub region: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncObjectStorageResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncFilesRequest {
    #[prost(string, tag = "1")]
    pub source_path: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub destination_path: ::prost::alloc::string::String,
    /// Remove destination files that are absent from the source
    #[prost(bool, tag = "3")]
    pub delete_extraneous: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SyncFilesResponse {}
