/// Declares an enum whose variants each wrap one described composite.
///
/// Serialization forwards to the wrapped value. Deserialization reads the
/// descriptor (symbolic name or numeric code) and decodes the matching
/// variant.
macro_rules! described_union {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident($ty:ty) = ($sym:literal, $code:literal)
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        pub enum $name {
            $(
                $(#[$vmeta])*
                $variant($ty),
            )+
        }

        const _: () = {
            use serde::de::{self, VariantAccess};

            impl serde::Serialize for $name {
                fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
                where
                    S: serde::Serializer,
                {
                    match self {
                        $( $name::$variant(value) => value.serialize(serializer), )+
                    }
                }
            }

            enum Field {
                $( $variant, )+
            }

            struct FieldVisitor;

            impl<'de> de::Visitor<'de> for FieldVisitor {
                type Value = Field;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("a descriptor name or code")
                }

                fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
                where
                    E: de::Error,
                {
                    match v {
                        $( $sym => Ok(Field::$variant), )+
                        _ => Err(de::Error::custom(format!("unknown descriptor name {}", v))),
                    }
                }

                fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
                where
                    E: de::Error,
                {
                    match v {
                        $( $code => Ok(Field::$variant), )+
                        _ => Err(de::Error::custom(format!("unknown descriptor code {:#x}", v))),
                    }
                }
            }

            impl<'de> de::Deserialize<'de> for Field {
                fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
                where
                    D: serde::Deserializer<'de>,
                {
                    deserializer.deserialize_identifier(FieldVisitor)
                }
            }

            struct Visitor;

            impl<'de> de::Visitor<'de> for Visitor {
                type Value = $name;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str(concat!("enum ", stringify!($name)))
                }

                fn visit_enum<A>(self, data: A) -> Result<Self::Value, A::Error>
                where
                    A: de::EnumAccess<'de>,
                {
                    let (field, variant) = data.variant::<Field>()?;
                    match field {
                        $( Field::$variant => variant.newtype_variant().map($name::$variant), )+
                    }
                }
            }

            impl<'de> de::Deserialize<'de> for $name {
                fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
                where
                    D: serde::Deserializer<'de>,
                {
                    const VARIANTS: &[&str] = &[ $( $sym, )+ ];
                    deserializer.deserialize_enum(stringify!($name), VARIANTS, Visitor)
                }
            }
        };
    };
}

/// Declares a closed set of symbolic error conditions.
///
/// Each variant maps to exactly one AMQP symbol, both ways.
macro_rules! symbol_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident = $sym:literal
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                $variant,
            )+
        }

        impl $name {
            /// The AMQP symbol of this condition
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $sym, )+
                }
            }
        }

        impl<'a> TryFrom<&'a str> for $name {
            type Error = &'a str;

            fn try_from(value: &'a str) -> Result<Self, Self::Error> {
                match value {
                    $( $sym => Ok($name::$variant), )+
                    _ => Err(value),
                }
            }
        }

        impl From<$name> for serde_amqp::primitives::Symbol {
            fn from(value: $name) -> Self {
                serde_amqp::primitives::Symbol::from(value.as_str())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serde_amqp::primitives::Symbol::from(*self).serialize(serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let symbol = serde_amqp::primitives::Symbol::deserialize(deserializer)?;
                $name::try_from(symbol.as_str()).map_err(|value| {
                    serde::de::Error::custom(format!(
                        concat!("invalid symbol {} for ", stringify!($name)),
                        value
                    ))
                })
            }
        }
    };
}
