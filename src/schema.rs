//! Handwritten Diesel schema declarations matching `sql/schema.sql`.

diesel::table! {
    sensors (id) {
        id -> Int4,
        name -> Text,
        metric -> Text,
        unit -> Text,
        location -> Nullable<Text>,
    }
}

diesel::table! {
    readings (id) {
        id -> Int4,
        sensor_id -> Int4,
        metric -> Text,
        value -> Float8,
        timestamp -> Timestamptz,
    }
}

diesel::table! {
    recipes (id) {
        id -> Int4,
        name -> Text,
        description -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(readings -> sensors (sensor_id));

diesel::allow_tables_to_appear_in_same_query!(readings, recipes, sensors,);
