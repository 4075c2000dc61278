// Hand-maintained to match migrations/. `tag_reading` has no primary key in SQL;
// (time, tag_id) is declared here only because diesel requires one.

diesel::table! {
    device (id) {
        id -> Int4,
        gateway_id -> Int4,
        code -> Varchar,
    }
}

diesel::table! {
    gateway (id) {
        id -> Int4,
        name -> Varchar,
    }
}

diesel::table! {
    tag (id) {
        id -> Int4,
        device_id -> Int4,
        code -> Varchar,
        data_type -> Varchar,
    }
}

diesel::table! {
    tag_reading (time, tag_id) {
        time -> Timestamptz,
        device_id -> Int4,
        tag_id -> Int4,
        gateway_id -> Nullable<Int4>,
        value_type -> Text,
        value_num -> Nullable<Float8>,
        value_bool -> Nullable<Bool>,
        value_text -> Nullable<Text>,
        value_json -> Nullable<Jsonb>,
    }
}

diesel::joinable!(device -> gateway (gateway_id));
diesel::joinable!(tag -> device (device_id));
diesel::joinable!(tag_reading -> tag (tag_id));

diesel::allow_tables_to_appear_in_same_query!(device, gateway, tag, tag_reading,);
