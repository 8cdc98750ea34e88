use super::{DecodeError, FieldCodec};

/// Declares a fieldless enum together with its fixed string tokens and a
/// token codec.
macro_rules! token_enum {
    (
        $(#[$meta:meta])*
        $name:ident / $codec:ident as $field:literal {
            $($(#[$vmeta:meta])* $variant:ident => $token:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The fixed token used in storage and on the wire.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $token),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        #[doc = concat!("Codec mapping [`", stringify!($name), "`] to its string tokens.")]
        pub struct $codec;

        impl FieldCodec for $codec {
            type Value = $name;
            type Scalar = String;

            fn encode(value: &$name) -> String {
                value.as_str().to_owned()
            }

            fn decode(scalar: &String) -> Result<$name, DecodeError> {
                match scalar.as_str() {
                    $($token => Ok($name::$variant),)+
                    other => Err(DecodeError::UnknownToken {
                        field: $field,
                        token: other.to_owned(),
                    }),
                }
            }
        }

        serde_via_codec!($name, $codec, String);
    };
}

token_enum! {
    /// Playback progress of an episode.
    PlayState / PlayStateCodec as "play_state" {
        New => "new",
        InProgress => "in_progress",
        Played => "played",
    }
}

token_enum! {
    /// Local download status of an episode's enclosure.
    DownloadState / DownloadStateCodec as "download_state" {
        NotDownloaded => "not_downloaded",
        /// Queued or in flight; reported by the downloader.
        Downloading => "downloading",
        Downloaded => "downloaded",
        Failed => "failed",
    }
}

token_enum! {
    /// The kind of an episode action exchanged with the sync service.
    EpisodeActionKind / EpisodeActionKindCodec as "episode_action" {
        Play => "play",
        Download => "download",
        Delete => "delete",
        New => "new",
    }
}

token_enum! {
    /// A subscription list change exchanged with the sync service.
    SubscriptionAction / SubscriptionActionCodec as "subscription_action" {
        Add => "add",
        Remove => "remove",
    }
}

impl Default for PlayState {
    fn default() -> Self {
        PlayState::New
    }
}

impl Default for DownloadState {
    fn default() -> Self {
        DownloadState::NotDownloaded
    }
}
